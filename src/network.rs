//! Connectivity tracking.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::http::HttpExecutor;

/// Kind of link reported by the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
  Wifi,
  Cellular,
  Ethernet,
  Vpn,
  Other,
  None,
  #[default]
  Unknown,
}

/// Last observed connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkState {
  pub is_connected: bool,
  /// `None` while reachability has not been determined
  pub is_internet_reachable: Option<bool>,
  pub connection_type: ConnectionType,
}

impl NetworkState {
  pub fn online() -> Self {
    Self {
      is_connected: true,
      is_internet_reachable: Some(true),
      connection_type: ConnectionType::Unknown,
    }
  }

  pub fn offline() -> Self {
    Self {
      is_connected: false,
      is_internet_reachable: Some(false),
      connection_type: ConnectionType::None,
    }
  }

  /// Connected, and reachability not known to be lost.
  pub fn is_online(&self) -> bool {
    self.is_connected && self.is_internet_reachable != Some(false)
  }
}

impl Default for NetworkState {
  fn default() -> Self {
    Self::online()
  }
}

/// Flip of the online flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  WentOnline,
  WentOffline,
}

/// Publishes [`NetworkState`] changes to subscribers.
pub struct NetworkMonitor {
  tx: watch::Sender<NetworkState>,
}

impl NetworkMonitor {
  pub fn new(initial: NetworkState) -> Self {
    let (tx, _) = watch::channel(initial);
    Self { tx }
  }

  pub fn state(&self) -> NetworkState {
    *self.tx.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.state().is_online()
  }

  pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
    self.tx.subscribe()
  }

  /// Publish a new state. Returns the transition if the online flag flipped.
  pub fn set_state(&self, state: NetworkState) -> Option<Transition> {
    let mut transition = None;
    self.tx.send_if_modified(|current| {
      if *current == state {
        return false;
      }
      transition = match (current.is_online(), state.is_online()) {
        (false, true) => Some(Transition::WentOnline),
        (true, false) => Some(Transition::WentOffline),
        _ => None,
      };
      *current = state;
      true
    });

    match transition {
      Some(Transition::WentOnline) => {
        info!(connection = ?state.connection_type, "network connection restored")
      }
      Some(Transition::WentOffline) => info!("network connection lost"),
      None => debug!(?state, "network state updated"),
    }
    transition
  }

  pub fn set_online(&self, online: bool) -> Option<Transition> {
    let state = if online {
      NetworkState {
        connection_type: self.state().connection_type,
        ..NetworkState::online()
      }
    } else {
      NetworkState::offline()
    };
    self.set_state(state)
  }

  /// Probe the API and publish whether it answered.
  pub async fn refresh(&self, http: &HttpExecutor) -> NetworkState {
    let reachable = http.probe().await;
    self.set_online(reachable);
    self.state()
  }
}

impl Default for NetworkMonitor {
  fn default() -> Self {
    Self::new(NetworkState::default())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_online_rule() {
    assert!(NetworkState::online().is_online());
    assert!(!NetworkState::offline().is_online());

    let undetermined = NetworkState {
      is_connected: true,
      is_internet_reachable: None,
      connection_type: ConnectionType::Wifi,
    };
    assert!(undetermined.is_online());

    let captive = NetworkState {
      is_internet_reachable: Some(false),
      ..undetermined
    };
    assert!(!captive.is_online());
  }

  #[test]
  fn test_transitions() {
    let monitor = NetworkMonitor::new(NetworkState::offline());
    assert_eq!(monitor.set_online(true), Some(Transition::WentOnline));
    assert_eq!(monitor.set_online(true), None);
    assert_eq!(monitor.set_online(false), Some(Transition::WentOffline));
    assert!(!monitor.is_online());
  }

  #[test]
  fn test_connection_type_change_is_published_without_transition() {
    let monitor = NetworkMonitor::default();
    let mut rx = monitor.subscribe();

    let cellular = NetworkState {
      connection_type: ConnectionType::Cellular,
      ..NetworkState::online()
    };
    assert_eq!(monitor.set_state(cellular), None);
    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update().connection_type, ConnectionType::Cellular);

    // Identical state is not re-sent
    monitor.set_state(cellular);
    assert!(!rx.has_changed().unwrap());
  }

  #[test]
  fn test_connection_type_serializes_lowercase() {
    let json = serde_json::to_value(NetworkState::offline()).unwrap();
    assert_eq!(json["connectionType"], "none");
    assert_eq!(json["isInternetReachable"], false);
  }
}
