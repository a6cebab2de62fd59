//! Process-wide message class registry
//!
//! Wire deserialization and dead-letter replay reconstruct concrete
//! messages from a `message_class` string; the registry is the explicit
//! name-to-schema map that makes that possible.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use tracing::debug;

use crate::schema::MessageSchema;

static SCHEMAS: OnceLock<RwLock<HashMap<String, Arc<MessageSchema>>>> = OnceLock::new();

fn schemas() -> &'static RwLock<HashMap<String, Arc<MessageSchema>>> {
    SCHEMAS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Process-wide class-name to schema map.
pub struct SchemaRegistry;

impl SchemaRegistry {
    /// Register a schema under its class name.
    ///
    /// Idempotent: re-registering the same class name replaces the entry,
    /// so test suites can rebuild schemas freely.
    pub fn register(schema: Arc<MessageSchema>) {
        let mut map = schemas().write().expect("schema registry poisoned");
        if map
            .insert(schema.class_name().to_string(), schema.clone())
            .is_some()
        {
            debug!(class = schema.class_name(), "replaced registered schema");
        }
    }

    /// Look up a schema by class name.
    pub fn lookup(class_name: &str) -> Option<Arc<MessageSchema>> {
        schemas()
            .read()
            .expect("schema registry poisoned")
            .get(class_name)
            .cloned()
    }

    /// Remove a schema registration.
    pub fn unregister(class_name: &str) {
        schemas()
            .write()
            .expect("schema registry poisoned")
            .remove(class_name);
    }

    /// Registered class names.
    pub fn class_names() -> Vec<String> {
        schemas()
            .read()
            .expect("schema registry poisoned")
            .keys()
            .cloned()
            .collect()
    }
}
