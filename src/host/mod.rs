//! Host platform abstraction.
//!
//! The browser exposes windows, tabs and pages only through completion-handler
//! APIs. Handles carry no stable id and the host never announces that an
//! object went away. This module defines the capability surface the bridge
//! needs from the host and nothing more.

mod query;

pub use query::HostQueries;

use std::path::Path;

use serde_json::Value;

/// Callback a host invokes at most once with the answer to a query.
///
/// Hosts are allowed to never invoke it. Callers race it against a timeout.
pub type Completion<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// A reference to a host-side object (window, tab or page).
///
/// Two handles can refer to the same underlying object, so equality is host
/// identity, never value equality.
pub trait HostObject: Clone + Send + Sync + 'static {
    /// Whether both handles refer to the same host object.
    fn same_object(&self, other: &Self) -> bool;
}

/// Browser capabilities used by the bridge.
///
/// Completion methods may call back on any thread, late, or never.
pub trait BrowserHost: Send + Sync + 'static {
    type Window: HostObject;
    type Tab: HostObject;
    type Page: HostObject;

    /// Enumerate all open windows.
    fn windows(&self, done: Completion<Vec<Self::Window>>);

    /// The frontmost window. Some hosts never answer when there is none.
    fn active_window(&self, done: Completion<Option<Self::Window>>);

    /// Enumerate the tabs of a window.
    fn tabs(&self, window: &Self::Window, done: Completion<Vec<Self::Tab>>);

    /// The selected tab of a window.
    fn active_tab(&self, window: &Self::Window, done: Completion<Option<Self::Tab>>);

    /// The page currently loaded in a tab.
    fn active_page(&self, tab: &Self::Tab, done: Completion<Option<Self::Page>>);

    /// The tab a page lives in.
    fn containing_tab(&self, page: &Self::Page, done: Completion<Option<Self::Tab>>);

    /// The display title of a page.
    fn page_title(&self, page: &Self::Page, done: Completion<Option<String>>);

    /// Post a named message to the content script of a page.
    fn dispatch(&self, page: &Self::Page, name: &str, user_info: Value);

    /// Open a new window showing `url`.
    fn open_window(&self, url: &str, done: Completion<Option<Self::Window>>);

    /// Open `url` in a new tab of `window` and make it active.
    fn open_tab(&self, window: &Self::Window, url: &str, done: Completion<Option<Self::Tab>>);

    fn close_tab(&self, tab: &Self::Tab);

    fn activate_tab(&self, tab: &Self::Tab);

    /// Update the toolbar item of a window. `image` is a PNG on disk.
    fn set_toolbar_item(&self, window: &Self::Window, image: Option<&Path>, label: &str);

    /// Base URI of the extension's bundled resources.
    fn base_uri(&self, done: Completion<Option<String>>);

    /// User's preferred languages, most preferred first (e.g. `de-AT`).
    fn preferred_languages(&self) -> Vec<String>;

    /// Version string of the containing app, if known.
    fn version(&self) -> Option<String>;
}
