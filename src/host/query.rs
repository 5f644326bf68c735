//! Timeout-raced host queries.
//!
//! Every completion-handler call is bridged to a one-shot channel and raced
//! against a fixed wall-clock timeout. Whichever finishes first wins: a
//! callback arriving after the timeout sends into a closed channel and has no
//! effect. Timeout, a dropped completion and an explicit "none" all look the
//! same to callers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use super::{BrowserHost, Completion};

/// Async view of a [`BrowserHost`] with bounded waits.
pub struct HostQueries<H: BrowserHost> {
    host: Arc<H>,
    wait: Duration,
}

impl<H: BrowserHost> Clone for HostQueries<H> {
    fn clone(&self) -> Self {
        Self {
            host: Arc::clone(&self.host),
            wait: self.wait,
        }
    }
}

impl<H: BrowserHost> HostQueries<H> {
    pub fn new(host: Arc<H>, wait: Duration) -> Self {
        Self { host, wait }
    }

    /// The wrapped host, for fire-and-forget calls.
    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    async fn settle<T, F>(&self, what: &'static str, start: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&H, Completion<T>),
    {
        let (tx, rx) = oneshot::channel();
        start(
            &self.host,
            Box::new(move |value| {
                // Loses silently once the timeout has dropped the receiver
                let _ = tx.send(value);
            }),
        );

        match tokio::time::timeout(self.wait, rx).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(_)) => {
                debug!(target: "host", "{} completion dropped without an answer", what);
                None
            }
            Err(_) => {
                debug!(target: "host", "{} not answered within {:?}", what, self.wait);
                None
            }
        }
    }

    /// All windows, or `None` when the host did not answer.
    pub async fn windows(&self) -> Option<Vec<H::Window>> {
        self.settle("windows", |host, done| host.windows(done)).await
    }

    pub async fn active_window(&self) -> Option<H::Window> {
        self.settle("active_window", |host, done| host.active_window(done))
            .await
            .flatten()
    }

    /// Tabs of a window, or `None` when the host did not answer.
    pub async fn tabs(&self, window: &H::Window) -> Option<Vec<H::Tab>> {
        self.settle("tabs", |host, done| host.tabs(window, done)).await
    }

    pub async fn active_tab(&self, window: &H::Window) -> Option<H::Tab> {
        self.settle("active_tab", |host, done| host.active_tab(window, done))
            .await
            .flatten()
    }

    pub async fn active_page(&self, tab: &H::Tab) -> Option<H::Page> {
        self.settle("active_page", |host, done| host.active_page(tab, done))
            .await
            .flatten()
    }

    pub async fn containing_tab(&self, page: &H::Page) -> Option<H::Tab> {
        self.settle("containing_tab", |host, done| host.containing_tab(page, done))
            .await
            .flatten()
    }

    pub async fn page_title(&self, page: &H::Page) -> Option<String> {
        self.settle("page_title", |host, done| host.page_title(page, done))
            .await
            .flatten()
    }

    pub async fn open_window(&self, url: &str) -> Option<H::Window> {
        self.settle("open_window", |host, done| host.open_window(url, done))
            .await
            .flatten()
    }

    pub async fn open_tab(&self, window: &H::Window, url: &str) -> Option<H::Tab> {
        self.settle("open_tab", |host, done| host.open_tab(window, url, done))
            .await
            .flatten()
    }

    pub async fn base_uri(&self) -> Option<String> {
        self.settle("base_uri", |host, done| host.base_uri(done))
            .await
            .flatten()
    }

    /// Active tab of the active window.
    pub async fn frontmost_tab(&self) -> Option<H::Tab> {
        let window = self.active_window().await?;
        self.active_tab(&window).await
    }

    /// Active page of the active tab of the active window.
    pub async fn frontmost_page(&self) -> Option<H::Page> {
        let tab = self.frontmost_tab().await?;
        self.active_page(&tab).await
    }
}
