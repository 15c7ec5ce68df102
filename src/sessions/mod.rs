//! Session lifecycle management.
//!
//! [`Registry`] is the single authority over sessions and panes. It keeps the
//! id-index and name-index in one structure so they cannot drift apart, owns
//! the per-session attachment sets, and hands out monotonically increasing
//! ids that are never reused within a daemon lifetime.
//!
//! ## Concurrency
//!
//! The registry itself is plain synchronous data. The daemon wraps it — along
//! with the per-client frame senders and the pump handles — in [`Shared`]
//! behind a single `tokio::sync::RwLock`, so every mutation is serialized as
//! if one event loop owned the state. The fan-out pump
//! feeds the emulator and collects the attached clients' senders under that
//! lock, which is what keeps an attach replay strictly ordered before any
//! live output.

pub mod pump;
pub mod session;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::info;

use crate::error::RegistryError;
use crate::protocol::Message;

pub use session::{normalize_dimensions, now_secs, Pane, Session};

/// A session lookup key: by numeric id or by unique name.
#[derive(Debug, Clone, Copy)]
pub enum SessionRef<'a> {
    Id(u32),
    Name(&'a str),
}

impl std::fmt::Display for SessionRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionRef::Id(id) => write!(f, "{id}"),
            SessionRef::Name(name) => write!(f, "'{name}'"),
        }
    }
}

/// Owner of all sessions and panes.
pub struct Registry {
    sessions: BTreeMap<u32, Session>,
    by_name: HashMap<String, u32>,
    /// Client-connection ids watching each session. BTreeSet gives the pump
    /// a stable broadcast order.
    attached: HashMap<u32, BTreeSet<u64>>,
    next_session_id: u32,
    next_pane_id: u32,
    scrollback_lines: usize,
}

impl Registry {
    pub fn new(scrollback_lines: usize) -> Self {
        Registry {
            sessions: BTreeMap::new(),
            by_name: HashMap::new(),
            attached: HashMap::new(),
            next_session_id: 0,
            next_pane_id: 0,
            scrollback_lines,
        }
    }

    /// Create a session with one pane running `shell`.
    ///
    /// `name` must be non-empty and unused — the default-name policy runs in
    /// the connection handler, before this call.
    pub fn create_session(
        &mut self,
        name: &str,
        shell: &str,
        cols: u16,
        rows: u16,
    ) -> Result<&Session, RegistryError> {
        if self.by_name.contains_key(name) {
            return Err(RegistryError::NameInUse(name.to_string()));
        }

        let session_id = self.next_session_id;
        let pane_id = self.next_pane_id;
        let pane = Pane::spawn(pane_id, shell, cols, rows, self.scrollback_lines)?;
        // Ids advance only after the fallible spawn, but are still never
        // reused: a successful spawn is the only consumer.
        self.next_session_id += 1;
        self.next_pane_id += 1;

        let mut panes = BTreeMap::new();
        panes.insert(pane_id, pane);
        let session = Session {
            id: session_id,
            name: name.to_string(),
            panes,
            active_pane_id: pane_id,
            created_at: now_secs(),
        };

        self.sessions.insert(session_id, session);
        self.by_name.insert(name.to_string(), session_id);
        self.attached.insert(session_id, BTreeSet::new());

        info!(
            "session {session_id} '{name}' created, total: {}",
            self.sessions.len()
        );
        Ok(&self.sessions[&session_id])
    }

    /// Destroy a session: close every pane's PTY, terminate and reap its
    /// shell, drop all indices and the attachment set.
    pub fn destroy_session(&mut self, session_id: u32) -> Result<(), RegistryError> {
        let session = self
            .sessions
            .remove(&session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;
        for pane in session.panes.values() {
            pane.terminate();
        }
        self.by_name.remove(&session.name);
        self.attached.remove(&session_id);
        info!(
            "session {session_id} '{}' destroyed, remaining: {}",
            session.name,
            self.sessions.len()
        );
        // Dropping the session closes every master fd.
        Ok(())
    }

    /// Add a pane to an existing session.
    pub fn create_pane(
        &mut self,
        session_id: u32,
        shell: &str,
        cols: u16,
        rows: u16,
    ) -> Result<&Pane, RegistryError> {
        let scrollback = self.scrollback_lines;
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;
        let pane_id = self.next_pane_id;
        let pane = Pane::spawn(pane_id, shell, cols, rows, scrollback)?;
        self.next_pane_id += 1;
        session.panes.insert(pane_id, pane);
        Ok(&session.panes[&pane_id])
    }

    /// Destroy one pane. The last pane of a session can only go down with
    /// the whole session; destroying the active pane promotes the lowest
    /// remaining pane id.
    pub fn destroy_pane(&mut self, session_id: u32, pane_id: u32) -> Result<(), RegistryError> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;
        if !session.panes.contains_key(&pane_id) {
            return Err(RegistryError::PaneNotFound {
                session: session_id,
                pane: pane_id,
            });
        }
        if session.panes.len() == 1 {
            return Err(RegistryError::LastPane(session_id));
        }
        let pane = session.panes.remove(&pane_id).expect("checked above");
        pane.terminate();
        if session.active_pane_id == pane_id {
            session.active_pane_id = *session.panes.keys().next().expect("len > 1 before remove");
        }
        Ok(())
    }

    /// Find a session by id or name.
    pub fn find(&self, target: SessionRef<'_>) -> Option<&Session> {
        match target {
            SessionRef::Id(id) => self.sessions.get(&id),
            SessionRef::Name(name) => self.by_name.get(name).and_then(|id| self.sessions.get(id)),
        }
    }

    pub fn session(&self, session_id: u32) -> Option<&Session> {
        self.sessions.get(&session_id)
    }

    pub fn session_mut(&mut self, session_id: u32) -> Option<&mut Session> {
        self.sessions.get_mut(&session_id)
    }

    /// All sessions as (id, name), ascending by id.
    pub fn list(&self) -> Vec<(u32, String)> {
        self.sessions
            .values()
            .map(|s| (s.id, s.name.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn session_ids(&self) -> Vec<u32> {
        self.sessions.keys().copied().collect()
    }

    /// Record a client watching a session.
    pub fn attach(&mut self, session_id: u32, client_id: u64) -> Result<(), RegistryError> {
        self.attached
            .get_mut(&session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?
            .insert(client_id);
        Ok(())
    }

    /// Remove a client from a session's watchers. Detaching a client that
    /// was never attached is a no-op.
    pub fn detach(&mut self, session_id: u32, client_id: u64) -> Result<(), RegistryError> {
        self.attached
            .get_mut(&session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?
            .remove(&client_id);
        Ok(())
    }

    /// Client ids currently attached, in stable ascending order.
    pub fn attached(&self, session_id: u32) -> Result<Vec<u64>, RegistryError> {
        Ok(self
            .attached
            .get(&session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?
            .iter()
            .copied()
            .collect())
    }

    pub fn attached_count(&self, session_id: u32) -> usize {
        self.attached.get(&session_id).map_or(0, BTreeSet::len)
    }

    /// Default session name: `main` first, then the smallest free
    /// `session-<n>`.
    pub fn default_session_name(&self) -> String {
        if self.sessions.is_empty() {
            return "main".to_string();
        }
        let mut n = 1;
        loop {
            let candidate = format!("session-{n}");
            if !self.by_name.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Store the exit status reaped for `pid`, if one of our panes owned it.
    /// Returns the (session, pane) that matched.
    pub fn record_exit(&mut self, pid: u32, exit_code: i32) -> Option<(u32, u32)> {
        for session in self.sessions.values_mut() {
            for pane in session.panes.values_mut() {
                if pane.pid == pid {
                    pane.exit_code = Some(exit_code);
                    return Some((session.id, pane.id));
                }
            }
        }
        None
    }
}

/// Daemon-wide mutable state: the registry plus the connection-facing maps.
///
/// Everything that a single event loop would own lives here, behind one
/// lock: the registry, each connected client's outbound frame sender, and
/// the per-session pump handles.
pub struct Shared {
    pub registry: Registry,
    /// Outbound frame channel per connected client, keyed by connection id.
    pub clients: HashMap<u64, mpsc::Sender<Message>>,
    /// At most one pump per session, keyed by session id.
    pub pumps: HashMap<u32, tokio::task::JoinHandle<()>>,
}

/// Handle shared by the accept loop, connection handlers, pumps, and the
/// reaper.
pub type SharedState = Arc<RwLock<Shared>>;

impl Shared {
    pub fn new(scrollback_lines: usize) -> SharedState {
        Arc::new(RwLock::new(Shared {
            registry: Registry::new(scrollback_lines),
            clients: HashMap::new(),
            pumps: HashMap::new(),
        }))
    }

    /// (client id, sender) for every client attached to a session, in the
    /// registry's stable order.
    pub fn output_targets(&self, session_id: u32) -> Vec<(u64, mpsc::Sender<Message>)> {
        let Ok(ids) = self.registry.attached(session_id) else {
            return Vec::new();
        };
        ids.into_iter()
            .filter_map(|cid| self.clients.get(&cid).map(|tx| (cid, tx.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHELL: &str = "/bin/sh";

    fn registry() -> Registry {
        Registry::new(100)
    }

    /// The invariants of the data model, checked after mutations.
    fn check_invariants(r: &Registry) {
        for (id, name) in r.list() {
            let by_id = r.find(SessionRef::Id(id)).expect("listed id resolves");
            let by_name = r.find(SessionRef::Name(&name)).expect("listed name resolves");
            assert_eq!(by_id.id, by_name.id);
            assert!(by_id.panes.contains_key(&by_id.active_pane_id));
            assert!(!by_id.panes.is_empty());
            assert!(r.attached(id).is_ok());
        }
    }

    #[tokio::test]
    async fn create_find_list_destroy() {
        let mut r = registry();
        let id = r.create_session("work", SHELL, 80, 24).unwrap().id;
        check_invariants(&r);
        assert_eq!(r.list(), vec![(id, "work".to_string())]);
        assert!(r.find(SessionRef::Name("work")).is_some());
        assert!(r.find(SessionRef::Id(id)).is_some());
        assert!(r.find(SessionRef::Id(id + 1)).is_none());

        r.destroy_session(id).unwrap();
        assert!(r.list().is_empty());
        assert!(r.find(SessionRef::Name("work")).is_none());
        assert!(matches!(
            r.destroy_session(id),
            Err(RegistryError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let mut r = registry();
        r.create_session("main", SHELL, 80, 24).unwrap();
        assert!(matches!(
            r.create_session("main", SHELL, 80, 24),
            Err(RegistryError::NameInUse(_))
        ));
        check_invariants(&r);
        for id in r.session_ids() {
            r.destroy_session(id).unwrap();
        }
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_never_reused() {
        let mut r = registry();
        let a = r.create_session("a", SHELL, 80, 24).unwrap().id;
        let b = r.create_session("b", SHELL, 80, 24).unwrap().id;
        assert!(b > a);
        r.destroy_session(b).unwrap();
        let c = r.create_session("c", SHELL, 80, 24).unwrap().id;
        assert!(c > b, "destroyed id {b} must not be reused (got {c})");
        check_invariants(&r);
        for id in r.session_ids() {
            r.destroy_session(id).unwrap();
        }
    }

    #[tokio::test]
    async fn attach_detach_and_nonmember_detach() {
        let mut r = registry();
        let id = r.create_session("s", SHELL, 80, 24).unwrap().id;
        r.attach(id, 1).unwrap();
        r.attach(id, 2).unwrap();
        assert_eq!(r.attached(id).unwrap(), vec![1, 2]);
        assert_eq!(r.attached_count(id), 2);

        // Detach of a non-member is a no-op.
        r.detach(id, 99).unwrap();
        assert_eq!(r.attached(id).unwrap(), vec![1, 2]);

        r.detach(id, 1).unwrap();
        assert_eq!(r.attached(id).unwrap(), vec![2]);

        assert!(matches!(
            r.attach(id + 10, 1),
            Err(RegistryError::SessionNotFound(_))
        ));
        r.destroy_session(id).unwrap();
    }

    #[tokio::test]
    async fn pane_lifecycle_and_active_promotion() {
        let mut r = registry();
        let sid = r.create_session("panes", SHELL, 80, 24).unwrap().id;
        let first_pane = r.session(sid).unwrap().active_pane_id;

        // The last pane cannot be destroyed on its own.
        assert!(matches!(
            r.destroy_pane(sid, first_pane),
            Err(RegistryError::LastPane(_))
        ));

        let second_pane = r.create_pane(sid, SHELL, 80, 24).unwrap().id;
        assert!(second_pane > first_pane);

        // Destroying the active pane promotes the lowest remaining id.
        r.destroy_pane(sid, first_pane).unwrap();
        assert_eq!(r.session(sid).unwrap().active_pane_id, second_pane);
        check_invariants(&r);

        assert!(matches!(
            r.destroy_pane(sid, first_pane),
            Err(RegistryError::PaneNotFound { .. })
        ));
        r.destroy_session(sid).unwrap();
    }

    #[tokio::test]
    async fn default_name_policy() {
        let mut r = registry();
        assert_eq!(r.default_session_name(), "main");
        r.create_session("main", SHELL, 80, 24).unwrap();
        assert_eq!(r.default_session_name(), "session-1");
        r.create_session("session-1", SHELL, 80, 24).unwrap();
        assert_eq!(r.default_session_name(), "session-2");
        for id in r.session_ids() {
            r.destroy_session(id).unwrap();
        }
    }

    #[tokio::test]
    async fn tiny_dimensions_fall_back_to_defaults() {
        let mut r = registry();
        let sid = r.create_session("tiny", SHELL, 5, 3).unwrap().id;
        let pane = r.session(sid).unwrap().active_pane();
        assert_eq!((pane.cols, pane.rows), (80, 24));
        r.destroy_session(sid).unwrap();
    }

    #[tokio::test]
    async fn record_exit_finds_pane_by_pid() {
        let mut r = registry();
        let sid = r.create_session("x", SHELL, 80, 24).unwrap().id;
        let pid = r.session(sid).unwrap().active_pane().pid;
        let active = r.session(sid).unwrap().active_pane_id;
        let hit = r.record_exit(pid, 0);
        assert_eq!(hit, Some((sid, active)));
        assert_eq!(r.session(sid).unwrap().active_pane().exit_code, Some(0));
        assert_eq!(r.record_exit(pid.wrapping_add(100_000), 0), None);
        r.destroy_session(sid).unwrap();
    }
}
