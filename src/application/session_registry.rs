// Session registry - one shared session per site, reference counted by screens
use crate::application::site_session::{ScreenId, SessionDeps, SiteSession};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

struct Sessions {
    by_site: HashMap<String, Arc<SiteSession>>,
    foreground: bool,
}

pub struct SessionRegistry {
    deps: SessionDeps,
    sessions: Mutex<Sessions>,
    this: Weak<SessionRegistry>,
}

impl SessionRegistry {
    pub fn new(deps: SessionDeps) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            deps,
            sessions: Mutex::new(Sessions {
                by_site: HashMap::new(),
                foreground: true,
            }),
            this: this.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mount a screen for a site, creating the site's session on first use.
    pub fn attach(&self, site_id: &str) -> ScreenHandle {
        let mut sessions = self.lock();
        let foreground = sessions.foreground;
        let session = match sessions.by_site.get(site_id) {
            Some(session) if !session.is_shut_down() => session.clone(),
            _ => {
                tracing::info!("Opening session for site {}", site_id);
                let session = SiteSession::new(site_id, self.deps.clone(), foreground);
                sessions.by_site.insert(site_id.to_string(), session.clone());
                session
            }
        };

        // Counted under the registry lock so a concurrent release sees this screen
        let screen = session.attach_screen();
        drop(sessions);

        ScreenHandle {
            registry: self.this.clone(),
            session,
            screen,
        }
    }

    pub fn session(&self, site_id: &str) -> Option<Arc<SiteSession>> {
        self.lock().by_site.get(site_id).cloned()
    }

    pub fn site_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().by_site.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn set_foreground(&self, foreground: bool) {
        let sessions: Vec<Arc<SiteSession>> = {
            let mut sessions = self.lock();
            sessions.foreground = foreground;
            sessions.by_site.values().cloned().collect()
        };
        tracing::info!("Application foreground: {}", foreground);
        for session in sessions {
            session.set_foreground(foreground);
        }
    }

    /// Close every session; used when the application exits.
    pub fn shutdown_all(&self, reason: &str) {
        let sessions: Vec<Arc<SiteSession>> = self.lock().by_site.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.shutdown(reason);
        }
    }

    fn release(&self, session: &Arc<SiteSession>, screen: ScreenId) {
        let remaining = session.detach_screen(screen);
        if remaining > 0 || self.deps.config.session.keep_alive {
            return;
        }

        let removed = {
            let mut sessions = self.lock();
            // A screen may have attached between the detach and this lock
            match sessions.by_site.get(session.site_id()) {
                Some(current) if Arc::ptr_eq(current, session) && session.screen_count() == 0 => {
                    sessions.by_site.remove(session.site_id())
                }
                _ => None,
            }
        };

        if let Some(session) = removed {
            tracing::info!("Last screen for site {} closed", session.site_id());
            session.shutdown("last screen closed");
        }
    }
}

/// A mounted screen. Dropping it detaches the screen from its site.
pub struct ScreenHandle {
    registry: Weak<SessionRegistry>,
    session: Arc<SiteSession>,
    screen: ScreenId,
}

impl ScreenHandle {
    pub fn session(&self) -> &Arc<SiteSession> {
        &self.session
    }

    pub fn focus(&self) {
        self.session.focus(self.screen);
    }

    pub fn blur(&self) {
        self.session.blur(self.screen);
    }
}

impl Drop for ScreenHandle {
    fn drop(&mut self) {
        match self.registry.upgrade() {
            Some(registry) => registry.release(&self.session, self.screen),
            None => {
                self.session.detach_screen(self.screen);
            }
        }
    }
}
