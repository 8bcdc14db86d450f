//! Watcher sync state machine
//!
//! [`SyncCore`] holds the read model and has one ingestion method per
//! input. It performs no I/O: side effects are returned to the caller as
//! [`Effect`]s, and query results come back tagged with the
//! [`QueryTicket`] they were issued under.

use serde::Serialize;
use tracing::debug;

use crate::error::ApiError;
use crate::types::{ConnectionState, ListenerTarget, PageResult, Watcher, WatcherQuery};

/// Read model published to consumers after every change
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherSnapshot {
    pub connection: ConnectionState,
    /// Connection health as shown to the user
    pub connected: bool,
    /// Watchers as last pushed by the server
    pub roster: Vec<Watcher>,
    pub last_added: Option<Watcher>,
    /// Latest applied query result
    pub page: Option<PageResult>,
    /// `totalItems` of the latest applied query
    pub current_users: u64,
    pub listener_target: Option<ListenerTarget>,
    /// Parameters of the most recently requested query
    pub query: WatcherQuery,
}

/// Identifies one query issuance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTicket {
    pub seq: u64,
    pub query: WatcherQuery,
}

/// Side effect requested by a state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Re-issue the roster subscription on the push channel
    MakeListener,
}

/// What happened to a resolved query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    Applied,
    /// Superseded by newer parameters or a newer applied issuance
    Stale,
    /// Current but failed; the last good page is kept
    Failed(ApiError),
    /// Session rejected; recovery already happened centrally
    Unauthorized,
}

#[derive(Debug, Default)]
pub struct SyncCore {
    snapshot: WatcherSnapshot,
    next_seq: u64,
    applied_seq: Option<u64>,
    mounted: bool,
}

impl SyncCore {
    pub fn new(query: WatcherQuery) -> Self {
        Self {
            snapshot: WatcherSnapshot {
                query: query.normalized(),
                ..Default::default()
            },
            next_seq: 0,
            applied_seq: None,
            mounted: true,
        }
    }

    pub fn snapshot(&self) -> &WatcherSnapshot {
        &self.snapshot
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Record new query parameters and return the ticket to run them under
    pub fn request_query(&mut self, query: WatcherQuery) -> QueryTicket {
        self.snapshot.query = query.normalized();
        self.issue()
    }

    /// Re-run the current parameters
    pub fn refresh_query(&mut self) -> QueryTicket {
        self.issue()
    }

    fn issue(&mut self) -> QueryTicket {
        self.next_seq += 1;
        QueryTicket {
            seq: self.next_seq,
            query: self.snapshot.query.clone(),
        }
    }

    /// Apply a query resolution unless it is stale
    pub fn on_query_resolved(
        &mut self,
        ticket: QueryTicket,
        result: Result<PageResult, ApiError>,
    ) -> QueryOutcome {
        if !self.mounted
            || ticket.query != self.snapshot.query
            || self.applied_seq.is_some_and(|applied| ticket.seq < applied)
        {
            debug!("Discarding stale query result #{}", ticket.seq);
            return QueryOutcome::Stale;
        }

        match result {
            Ok(page) => {
                self.applied_seq = Some(ticket.seq);
                self.snapshot.current_users = page.total_items;
                self.snapshot.page = Some(page);
                QueryOutcome::Applied
            }
            Err(e) if e.is_unauthorized() => QueryOutcome::Unauthorized,
            Err(e) => QueryOutcome::Failed(e),
        }
    }

    /// Track channel health. Entering `Connected` asks for a re-subscription.
    pub fn on_connection_state(&mut self, state: ConnectionState) -> Vec<Effect> {
        if !self.mounted {
            return Vec::new();
        }
        let entered_connected =
            state == ConnectionState::Connected && self.snapshot.connection != state;
        self.snapshot.connection = state;
        self.snapshot.connected = state == ConnectionState::Connected;

        if entered_connected {
            vec![Effect::MakeListener]
        } else {
            Vec::new()
        }
    }

    /// Replace the roster wholesale
    pub fn on_update_watchers(&mut self, roster: Vec<Watcher>) {
        if !self.mounted {
            return;
        }
        self.snapshot.last_added = roster.last().cloned();
        self.snapshot.roster = roster;
    }

    pub fn on_listener_target(&mut self, target: ListenerTarget) {
        if !self.mounted {
            return;
        }
        self.snapshot.listener_target = Some(target);
    }

    /// Reset the push-derived state after the channel was released
    pub fn on_unmount(&mut self) {
        self.mounted = false;
        self.snapshot.roster.clear();
        self.snapshot.last_added = None;
        self.snapshot.connection = ConnectionState::Disconnected;
        self.snapshot.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Interaction, Platform};
    use proptest::prelude::*;

    fn watcher(id: &str) -> Watcher {
        Watcher {
            id: id.to_string(),
            username: format!("user-{}", id),
            platform: Platform::Youtube,
            interaction: Interaction::Comment,
        }
    }

    fn page(total_items: u64) -> PageResult {
        PageResult {
            data: Vec::new(),
            page: 1,
            page_size: 10,
            total_items,
            total_pages: total_items.div_ceil(10).max(1) as u32,
        }
    }

    #[test]
    fn newer_query_wins_over_late_older_one() {
        let mut core = SyncCore::new(WatcherQuery::default());
        let p1 = core.request_query(WatcherQuery::default().with_prefix("a"));
        let p2 = core.request_query(WatcherQuery::default().with_prefix("ab"));

        assert_eq!(core.on_query_resolved(p2, Ok(page(3))), QueryOutcome::Applied);
        assert_eq!(core.on_query_resolved(p1, Ok(page(30))), QueryOutcome::Stale);
        assert_eq!(core.snapshot().current_users, 3);
    }

    #[test]
    fn older_issuance_with_same_params_does_not_replace_newer() {
        let mut core = SyncCore::new(WatcherQuery::default());
        let first = core.refresh_query();
        let second = core.refresh_query();

        assert_eq!(core.on_query_resolved(second, Ok(page(5))), QueryOutcome::Applied);
        assert_eq!(core.on_query_resolved(first, Ok(page(4))), QueryOutcome::Stale);
        assert_eq!(core.snapshot().current_users, 5);
    }

    #[test]
    fn failed_query_keeps_last_good_page() {
        let mut core = SyncCore::new(WatcherQuery::default());
        let ok = core.refresh_query();
        core.on_query_resolved(ok, Ok(page(25)));

        let failing = core.refresh_query();
        let outcome = core.on_query_resolved(failing, Err(ApiError::new("Watcher failed", 503)));

        assert_eq!(
            outcome,
            QueryOutcome::Failed(ApiError::new("Watcher failed", 503))
        );
        assert_eq!(core.snapshot().current_users, 25);
        assert!(core.snapshot().page.is_some());
    }

    #[test]
    fn unauthorized_query_is_reported_separately() {
        let mut core = SyncCore::new(WatcherQuery::default());
        let ticket = core.refresh_query();
        let outcome = core.on_query_resolved(ticket, Err(ApiError::new("Watcher failed", 401)));
        assert_eq!(outcome, QueryOutcome::Unauthorized);
    }

    #[test]
    fn every_transition_into_connected_requests_listener() {
        let mut core = SyncCore::new(WatcherQuery::default());
        assert!(core.on_connection_state(ConnectionState::Connecting).is_empty());
        assert_eq!(
            core.on_connection_state(ConnectionState::Connected),
            vec![Effect::MakeListener]
        );
        assert!(core.on_connection_state(ConnectionState::Connected).is_empty());
        assert!(core.on_connection_state(ConnectionState::Reconnecting).is_empty());
        assert!(!core.snapshot().connected);
        assert_eq!(
            core.on_connection_state(ConnectionState::Connected),
            vec![Effect::MakeListener]
        );
        assert!(core.snapshot().connected);
    }

    #[test]
    fn reconnecting_leaves_roster_and_counts() {
        let mut core = SyncCore::new(WatcherQuery::default());
        let ticket = core.refresh_query();
        core.on_query_resolved(ticket, Ok(page(25)));
        core.on_connection_state(ConnectionState::Connected);
        core.on_update_watchers(vec![watcher("w1"), watcher("w2")]);

        core.on_connection_state(ConnectionState::Reconnecting);
        core.on_connection_state(ConnectionState::Disconnected);

        assert_eq!(core.snapshot().roster.len(), 2);
        assert_eq!(core.snapshot().current_users, 25);
    }

    #[test]
    fn push_does_not_touch_current_users() {
        let mut core = SyncCore::new(WatcherQuery::default());
        let ticket = core.refresh_query();
        core.on_query_resolved(ticket, Ok(page(25)));

        let roster: Vec<Watcher> = (1..=11).map(|i| watcher(&format!("w{}", i))).collect();
        core.on_update_watchers(roster);

        assert_eq!(core.snapshot().last_added.as_ref().map(|w| w.id.as_str()), Some("w11"));
        assert_eq!(core.snapshot().current_users, 25);
    }

    #[test]
    fn unmount_clears_roster_and_ignores_later_input() {
        let mut core = SyncCore::new(WatcherQuery::default());
        core.on_connection_state(ConnectionState::Connected);
        core.on_update_watchers(vec![watcher("w1")]);
        let pending = core.refresh_query();

        core.on_unmount();
        core.on_update_watchers(vec![watcher("w2")]);
        core.on_listener_target(ListenerTarget::cleared());

        assert!(core.on_connection_state(ConnectionState::Connected).is_empty());
        assert_eq!(core.on_query_resolved(pending, Ok(page(1))), QueryOutcome::Stale);
        assert!(core.snapshot().roster.is_empty());
        assert!(core.snapshot().last_added.is_none());
        assert!(core.snapshot().listener_target.is_none());
        assert!(!core.snapshot().connected);
    }

    #[test]
    fn listener_target_is_replaced() {
        let mut core = SyncCore::new(WatcherQuery::default());
        core.on_listener_target(ListenerTarget::new("vid", "tok"));
        core.on_listener_target(ListenerTarget::cleared());
        assert_eq!(
            core.snapshot().listener_target.as_ref().map(ToString::to_string),
            Some("video not set, streamlabs token not set".to_string())
        );
    }

    proptest! {
        #[test]
        fn last_added_tracks_latest_push(
            pushes in prop::collection::vec(prop::collection::vec("[a-z0-9]{1,8}", 0..12), 1..6)
        ) {
            let mut core = SyncCore::new(WatcherQuery::default());
            for ids in &pushes {
                core.on_update_watchers(ids.iter().map(|id| watcher(id)).collect());
            }

            let expected = pushes.last().and_then(|ids| ids.last()).cloned();
            let actual = core.snapshot().last_added.as_ref().map(|w| w.id.clone());
            prop_assert_eq!(actual, expected);
        }
    }
}
