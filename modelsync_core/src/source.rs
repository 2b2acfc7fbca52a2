//! Transport backends ("sources") the store dispatches remote actions to.
//!
//! The engine never talks to a network. It only resolves which named
//! sources an action goes to and calls them on the `remote` channel.

use crate::record::{Attributes, RecordRef};
use std::fmt;

/// Remote actions a source may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceAction {
    Fetch,
    Commit,
    Destroy,
    Find,
}

impl SourceAction {
    pub fn name(&self) -> &'static str {
        match self {
            SourceAction::Fetch => "fetch",
            SourceAction::Commit => "commit",
            SourceAction::Destroy => "destroy",
            SourceAction::Find => "find",
        }
    }
}

impl fmt::Display for SourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which registered sources an action is sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSelector {
    /// Every registered source.
    All,
    /// One source by name.
    Named(String),
    /// Several sources, in this order.
    List(Vec<String>),
}

/// Options for `Store::remote`.
#[derive(Debug, Clone, Default)]
pub struct RemoteOptions {
    /// Overrides the record kind's default selector.
    pub source: Option<SourceSelector>,

    /// Free-form parameters passed through to the source.
    pub params: Attributes,
}

/// A transport backend.
pub trait Source {
    /// Whether this source implements `action`. Unsupported actions are
    /// skipped silently.
    fn supports(&self, action: SourceAction) -> bool {
        let _ = action;
        true
    }

    fn dispatch(&self, action: SourceAction, record: &RecordRef, options: &RemoteOptions);
}
