//! Tab and page identities kept in sync with the host.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::IdentityRegistry;
use crate::host::{BrowserHost, HostQueries};
use crate::message::{TabId, NO_TAB};

/// Outcome of one liveness sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub tabs_removed: usize,
    pub pages_removed: usize,
    /// The host did not finish enumerating; nothing was removed.
    pub skipped: bool,
}

/// Tab and page registries plus the host queries needed to sweep them.
pub struct TabTracker<H: BrowserHost> {
    queries: HostQueries<H>,
    tabs: IdentityRegistry<H::Tab>,
    pages: IdentityRegistry<H::Page>,
}

impl<H: BrowserHost> TabTracker<H> {
    pub fn new(queries: HostQueries<H>) -> Self {
        Self {
            queries,
            tabs: IdentityRegistry::new(),
            pages: IdentityRegistry::new(),
        }
    }

    pub fn queries(&self) -> &HostQueries<H> {
        &self.queries
    }

    pub fn tabs(&self) -> &IdentityRegistry<H::Tab> {
        &self.tabs
    }

    pub fn pages(&self) -> &IdentityRegistry<H::Page> {
        &self.pages
    }

    /// Id for a tab, assigned on first sight.
    pub fn tab_id(&self, tab: &H::Tab) -> TabId {
        self.tabs.resolve_or_assign(tab)
    }

    /// Id for a page, assigned on first sight.
    pub fn page_id(&self, page: &H::Page) -> TabId {
        self.pages.resolve_or_assign(page)
    }

    /// Reconcile both registries with the host's windows.
    ///
    /// A tab counts as live when it appears in any window, frontmost or not.
    /// If any enumeration goes unanswered the sweep is abandoned: an
    /// incomplete live set would purge tabs that are still open.
    pub async fn sweep(&self) -> SweepReport {
        let tab_token = self.tabs.begin_sweep();
        let page_token = self.pages.begin_sweep();

        let Some(windows) = self.queries.windows().await else {
            warn!(target: "identity", "window enumeration unanswered, skipping sweep");
            return SweepReport {
                skipped: true,
                ..Default::default()
            };
        };

        let mut live_tabs = Vec::new();
        let mut live_pages = Vec::new();
        for window in &windows {
            let Some(tabs) = self.queries.tabs(window).await else {
                warn!(target: "identity", "tab enumeration unanswered, skipping sweep");
                return SweepReport {
                    skipped: true,
                    ..Default::default()
                };
            };
            for tab in tabs {
                if let Some(page) = self.queries.active_page(&tab).await {
                    live_pages.push(page);
                }
                live_tabs.push(tab);
            }
        }

        let report = SweepReport {
            tabs_removed: self.tabs.retain_live(tab_token, &live_tabs).len(),
            pages_removed: self.pages.retain_live(page_token, &live_pages).len(),
            skipped: false,
        };

        if report.tabs_removed > 0 || report.pages_removed > 0 {
            debug!(
                target: "identity",
                "sweep removed {} tab(s) and {} page(s)",
                report.tabs_removed,
                report.pages_removed
            );
        }
        report
    }

    /// Live tab for `id`. Sweeps first so a stale entry is never returned.
    pub async fn tab(&self, id: TabId) -> Option<H::Tab> {
        if id == NO_TAB {
            return None;
        }
        self.sweep().await;
        self.tabs.lookup(id)
    }

    /// Live page for `id`. Sweeps first so a stale entry is never returned.
    pub async fn page(&self, id: TabId) -> Option<H::Page> {
        if id == NO_TAB {
            return None;
        }
        self.sweep().await;
        self.pages.lookup(id)
    }

    /// Id of the active tab of the active window.
    pub async fn active_tab_id(&self) -> Option<TabId> {
        let tab = self.queries.frontmost_tab().await?;
        Some(self.tab_id(&tab))
    }

    /// Id of the page shown in the active tab.
    pub async fn active_page_id(&self) -> Option<TabId> {
        let page = self.queries.frontmost_page().await?;
        Some(self.page_id(&page))
    }

    /// Sweep now and then every `every` until the task is aborted.
    pub fn spawn_periodic_sweep(self: &Arc<Self>, handle: &Handle, every: Duration) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tracker.sweep().await;
            }
        })
    }
}
