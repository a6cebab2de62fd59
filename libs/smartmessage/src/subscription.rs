//! Subscription records, handlers, and route-time filters

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use regex::Regex;
use uuid::Uuid;

use smartmessage_errors::Result;

use crate::header::MessageHeader;
use crate::message::Message;

/// Method name used when a class subscribes its default handler.
pub const DEFAULT_HANDLER_METHOD: &str = "process";

/// Stable id for a named handler: `<Class>.<method>`.
pub fn named_handler_id(message_class: &str, method: &str) -> String {
    format!("{}.{}", message_class, method)
}

/// A function invoked for each received message.
///
/// The id is stable across the process lifetime; it scopes deduplication
/// and appears in logs and dead-letter records.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<()>;

    fn id(&self) -> &str;
}

/// Closure-backed handler with a generated `proc_<nonce>` id.
pub struct FnHandler {
    id: String,
    func: Box<dyn Fn(Message) -> BoxFuture<'static, Result<()>> + Send + Sync>,
}

impl FnHandler {
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let nonce = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("proc_{}", &nonce[..8]),
            func: Box::new(move |message| Box::pin(func(message))),
        }
    }

    /// Closure handler with an explicit id, for stable dedup scoping.
    pub fn with_id<F, Fut>(id: &str, func: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            id: id.to_string(),
            func: Box::new(move |message| Box::pin(func(message))),
        }
    }
}

#[async_trait]
impl MessageHandler for FnHandler {
    async fn handle(&self, message: &Message) -> Result<()> {
        (self.func)(message.clone()).await
    }

    fn id(&self) -> &str {
        &self.id
    }
}

/// One element of a `to`/`from` filter: an exact string or a pattern.
#[derive(Debug, Clone)]
pub enum FilterValue {
    Literal(String),
    Pattern(Regex),
}

impl FilterValue {
    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            Self::Literal(expected) => expected == candidate,
            Self::Pattern(regex) => regex.is_match(candidate),
        }
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        Self::Literal(value.to_string())
    }
}

impl From<Regex> for FilterValue {
    fn from(value: Regex) -> Self {
        Self::Pattern(value)
    }
}

/// How configured filter kinds combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    /// Include when any configured kind matches (default)
    #[default]
    Any,
    /// Include only when every configured kind matches
    All,
}

/// Route-time predicate set for a subscription.
///
/// Three kinds: `broadcast` (recipient is nil), `to` (recipient equals any
/// element), `from` (sender equals any element). Elements within a kind
/// always OR together; kinds combine per [`FilterMode`], defaulting to OR.
/// With no kinds configured every envelope is included.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    broadcast: Option<bool>,
    to: Vec<FilterValue>,
    from: Vec<FilterValue>,
    mode: FilterMode,
}

impl SubscriptionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match envelopes whose recipient is nil (or non-nil for `false`).
    pub fn broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = Some(broadcast);
        self
    }

    /// Add a recipient element.
    pub fn to(mut self, value: impl Into<FilterValue>) -> Self {
        self.to.push(value.into());
        self
    }

    /// Add a sender element.
    pub fn from(mut self, value: impl Into<FilterValue>) -> Self {
        self.from.push(value.into());
        self
    }

    pub fn mode(mut self, mode: FilterMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.broadcast.is_none() && self.to.is_empty() && self.from.is_empty()
    }

    /// Evaluate the filter against an envelope header.
    pub fn accepts(&self, header: &MessageHeader) -> bool {
        if self.is_empty() {
            return true;
        }

        let mut verdicts = Vec::with_capacity(3);

        if let Some(expected) = self.broadcast {
            verdicts.push(header.is_broadcast() == expected);
        }
        if !self.to.is_empty() {
            verdicts.push(match header.to() {
                Some(to) => self.to.iter().any(|v| v.matches(to)),
                None => false,
            });
        }
        if !self.from.is_empty() {
            verdicts.push(self.from.iter().any(|v| v.matches(header.from())));
        }

        match self.mode {
            FilterMode::Any => verdicts.into_iter().any(|v| v),
            FilterMode::All => verdicts.into_iter().all(|v| v),
        }
    }
}

/// An entry in the dispatcher's subscription table.
#[derive(Clone)]
pub struct Subscription {
    message_class: String,
    handler: Arc<dyn MessageHandler>,
    filter: SubscriptionFilter,
}

impl Subscription {
    pub fn new(
        message_class: &str,
        handler: Arc<dyn MessageHandler>,
        filter: SubscriptionFilter,
    ) -> Self {
        Self {
            message_class: message_class.to_string(),
            handler,
            filter,
        }
    }

    pub fn message_class(&self) -> &str {
        &self.message_class
    }

    pub fn handler(&self) -> &Arc<dyn MessageHandler> {
        &self.handler
    }

    pub fn handler_id(&self) -> &str {
        self.handler.id()
    }

    pub fn filter(&self) -> &SubscriptionFilter {
        &self.filter
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("message_class", &self.message_class)
            .field("handler_id", &self.handler_id())
            .field("filter", &self.filter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(from: &str, to: Option<&str>) -> MessageHeader {
        MessageHeader::new("Announcement", from, to, None, 1)
    }

    #[test]
    fn empty_filter_accepts_everything() {
        let filter = SubscriptionFilter::new();
        assert!(filter.accepts(&header("anyone", None)));
        assert!(filter.accepts(&header("anyone", Some("someone"))));
    }

    #[test]
    fn broadcast_filter_matches_nil_recipient_only() {
        let filter = SubscriptionFilter::new().broadcast(true);
        assert!(filter.accepts(&header("svc", None)));
        assert!(!filter.accepts(&header("svc", Some("alpha"))));
    }

    #[test]
    fn kinds_or_together_by_default() {
        // broadcast OR to == my-service
        let filter = SubscriptionFilter::new().broadcast(true).to("my-service");

        assert!(filter.accepts(&header("svc", None)));
        assert!(filter.accepts(&header("svc", Some("my-service"))));
        assert!(!filter.accepts(&header("svc", Some("other"))));
    }

    #[test]
    fn all_mode_requires_every_kind() {
        let filter = SubscriptionFilter::new()
            .from("admin")
            .to("alpha")
            .mode(FilterMode::All);

        assert!(filter.accepts(&header("admin", Some("alpha"))));
        assert!(!filter.accepts(&header("admin", Some("beta"))));
        assert!(!filter.accepts(&header("other", Some("alpha"))));
    }

    #[test]
    fn array_elements_are_a_union() {
        let filter = SubscriptionFilter::new()
            .from("alpha")
            .from(Regex::new("^svc-[0-9]+$").unwrap());

        assert!(filter.accepts(&header("alpha", None)));
        assert!(filter.accepts(&header("svc-42", None)));
        assert!(!filter.accepts(&header("svc-x", None)));
    }

    #[test]
    fn fn_handler_ids_are_prefixed_and_unique() {
        let a = FnHandler::new(|_msg| async { Ok(()) });
        let b = FnHandler::new(|_msg| async { Ok(()) });
        assert!(a.id().starts_with("proc_"));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn named_ids_follow_class_method_form() {
        assert_eq!(named_handler_id("Order", "process"), "Order.process");
    }
}
