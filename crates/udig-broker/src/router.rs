use dashmap::DashMap;
use std::sync::Arc;
use udig_common::{BrokerChannel, TunnelId};
use uuid::Uuid;

/// Identifies one accepted uplink connection
pub type SessionId = Uuid;

/// A link connection that passed registration
#[derive(Clone)]
pub struct RegisteredUplink {
    pub tunnel_id: TunnelId,
    pub session_id: SessionId,
    pub channel: BrokerChannel,
}

/// Sessions serving one tunnel, picked in turn
#[derive(Default)]
struct Sessions {
    uplinks: Vec<RegisteredUplink>,
    cursor: usize,
}

/// Maps tunnel ids to the link sessions currently serving them.
///
/// A tunnel is present only while it has at least one session. Every
/// operation runs under a single shard lock and never awaits.
pub struct RouteTable {
    routes: DashMap<TunnelId, Sessions>,
}

impl RouteTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish a session. Adding the same session twice replaces its channel.
    pub fn add(&self, uplink: RegisteredUplink) {
        let mut sessions = self.routes.entry(uplink.tunnel_id.clone()).or_default();
        match sessions
            .uplinks
            .iter_mut()
            .find(|u| u.session_id == uplink.session_id)
        {
            Some(existing) => *existing = uplink,
            None => sessions.uplinks.push(uplink),
        }
    }

    /// Withdraw a session. Returns false if it was not published.
    pub fn remove(&self, tunnel_id: &str, session_id: SessionId) -> bool {
        let removed = match self.routes.get_mut(tunnel_id) {
            Some(mut sessions) => {
                let before = sessions.uplinks.len();
                sessions.uplinks.retain(|u| u.session_id != session_id);
                sessions.uplinks.len() != before
            }
            None => false,
        };
        self.routes
            .remove_if(tunnel_id, |_, sessions| sessions.uplinks.is_empty());
        removed
    }

    /// Pick the next live session for a tunnel, round-robin
    pub fn pick_for(&self, tunnel_id: &str) -> Option<RegisteredUplink> {
        let mut sessions = self.routes.get_mut(tunnel_id)?;
        let count = sessions.uplinks.len();
        for _ in 0..count {
            let index = sessions.cursor % count;
            sessions.cursor = sessions.cursor.wrapping_add(1);
            let uplink = &sessions.uplinks[index];
            if !uplink.channel.is_closed() {
                return Some(uplink.clone());
            }
        }
        None
    }

    /// Number of tunnels with at least one session
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn sessions_for(&self, tunnel_id: &str) -> usize {
        self.routes
            .get(tunnel_id)
            .map(|s| s.uplinks.len())
            .unwrap_or(0)
    }

    /// Tunnel ids with their session counts, sorted by id
    pub fn snapshot(&self) -> Vec<(String, usize)> {
        let mut routes: Vec<_> = self
            .routes
            .iter()
            .map(|r| (r.key().to_string(), r.uplinks.len()))
            .collect();
        routes.sort();
        routes
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self {
            routes: DashMap::new(),
        }
    }
}
