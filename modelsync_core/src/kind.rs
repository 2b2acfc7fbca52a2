//! Record kinds: the "class" of a record.
//!
//! A kind names the primary-key attribute, an optional parse hook applied
//! to raw payloads, whether the store should wire itself to record events,
//! a parent kind (sub-kinds are accepted wherever the parent is) and the
//! default transport selector used by `Store::remote`.

use crate::record::Attributes;
use crate::source::SourceSelector;
use std::fmt;
use std::rc::Rc;

/// Transforms a raw payload into record attributes.
pub type ParseFn = Rc<dyn Fn(Attributes) -> Attributes>;

/// Descriptor shared by every record of one kind.
#[derive(Clone)]
pub struct RecordKind {
    name: String,
    primary_key: String,
    parse: Option<ParseFn>,
    headless: bool,
    parent: Option<Rc<RecordKind>>,
    source: Option<SourceSelector>,
}

impl RecordKind {
    /// Creates a root kind with primary key `"id"`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: "id".to_string(),
            parse: None,
            headless: false,
            parent: None,
            source: None,
        }
    }

    /// Creates a sub-kind inheriting everything but the name from `parent`.
    pub fn extending(parent: &Rc<RecordKind>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: Some(Rc::clone(parent)),
            ..(**parent).clone()
        }
    }

    pub fn with_primary_key(mut self, key: impl Into<String>) -> Self {
        self.primary_key = key.into();
        self
    }

    pub fn with_parse(mut self, parse: impl Fn(Attributes) -> Attributes + 'static) -> Self {
        self.parse = Some(Rc::new(parse));
        self
    }

    /// Headless records are registered but the store never listens to them.
    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_source(mut self, source: SourceSelector) -> Self {
        self.source = Some(source);
        self
    }

    pub fn shared(self) -> Rc<Self> {
        Rc::new(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn is_headless(&self) -> bool {
        self.headless
    }

    pub fn parent(&self) -> Option<&Rc<RecordKind>> {
        self.parent.as_ref()
    }

    pub fn source(&self) -> Option<&SourceSelector> {
        self.source.as_ref()
    }

    /// Runs the parse hook, or returns `data` untouched when there is none.
    pub fn parse(&self, data: Attributes) -> Attributes {
        match &self.parse {
            Some(parse) => parse(data),
            None => data,
        }
    }

    /// True if this kind is `other` or descends from it.
    ///
    /// Kinds are compared by name; names are unique within one store.
    pub fn is_a(&self, other: &RecordKind) -> bool {
        if self.name == other.name {
            return true;
        }
        let mut current = self.parent.as_ref();
        while let Some(kind) = current {
            if kind.name == other.name {
                return true;
            }
            current = kind.parent.as_ref();
        }
        false
    }
}

impl fmt::Debug for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordKind")
            .field("name", &self.name)
            .field("primary_key", &self.primary_key)
            .field("parse", &self.parse.is_some())
            .field("headless", &self.headless)
            .field("parent", &self.parent.as_ref().map(|p| p.name.clone()))
            .field("source", &self.source)
            .finish()
    }
}
