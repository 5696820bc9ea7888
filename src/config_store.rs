//! Typed live configuration store
//!
//! Keys are declared up front in a [`Schema`] with a type, flags, an optional
//! default (static, or computed from the other values and optionally cached),
//! an optional normalizer and an optional validator.
//!
//! Changes go through two phases. [`ConfigStore::prepare`] validates a batch
//! of updates against the schema and returns either every problem found or a
//! [`PreparedChange`]. [`ConfigStore::commit`] swaps the prepared values in and
//! cannot fail.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

pub const FILTERED: &str = "[FILTERED]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    Int,
    Uint,
    Bool,
    Array,
    StringArray,
    Object,
    Any,
}

impl ValueType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ValueType::String => value.is_string(),
            ValueType::Int => value.is_i64() || value.is_u64(),
            ValueType::Uint => value.is_u64(),
            ValueType::Bool => value.is_boolean(),
            ValueType::Array => value.is_array(),
            ValueType::StringArray => value
                .as_array()
                .map(|items| items.iter().all(Value::is_string))
                .unwrap_or(false),
            ValueType::Object => value.is_object(),
            ValueType::Any => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Int => "integer",
            ValueType::Uint => "unsigned integer",
            ValueType::Bool => "boolean",
            ValueType::Array => "array",
            ValueType::StringArray => "array of strings",
            ValueType::Object => "object",
            ValueType::Any => "any",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyFlags {
    pub required: bool,
    /// May only be set once, at initialization
    pub read_only: bool,
    /// Masked in dumps
    pub secret: bool,
}

impl KeyFlags {
    pub const NONE: KeyFlags = KeyFlags {
        required: false,
        read_only: false,
        secret: false,
    };
    pub const REQUIRED: KeyFlags = KeyFlags {
        required: true,
        read_only: false,
        secret: false,
    };
    pub const READ_ONLY: KeyFlags = KeyFlags {
        required: false,
        read_only: true,
        secret: false,
    };
    pub const SECRET: KeyFlags = KeyFlags {
        required: false,
        read_only: false,
        secret: true,
    };

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Read access to effective values, handed to dynamic defaults and validators
pub trait ConfigView {
    fn value(&self, key: &str) -> Option<Value>;
}

type DynamicDefault = Arc<dyn Fn(&dyn ConfigView) -> Value + Send + Sync>;
type Normalizer = Arc<dyn Fn(Value) -> Value + Send + Sync>;
type Validator = Arc<dyn Fn(&Value, &dyn ConfigView) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
pub enum DefaultValue {
    None,
    Static(Value),
    Dynamic { compute: DynamicDefault, cache: bool },
}

impl DefaultValue {
    pub fn dynamic(compute: impl Fn(&dyn ConfigView) -> Value + Send + Sync + 'static) -> Self {
        DefaultValue::Dynamic {
            compute: Arc::new(compute),
            cache: false,
        }
    }

    pub fn cached(compute: impl Fn(&dyn ConfigView) -> Value + Send + Sync + 'static) -> Self {
        DefaultValue::Dynamic {
            compute: Arc::new(compute),
            cache: true,
        }
    }
}

#[derive(Clone)]
pub struct KeySpec {
    pub value_type: ValueType,
    pub flags: KeyFlags,
    pub default: DefaultValue,
    normalizer: Option<Normalizer>,
    validator: Option<Validator>,
}

#[derive(Clone, Default)]
pub struct Schema {
    keys: BTreeMap<String, KeySpec>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, key: &str, value_type: ValueType, flags: KeyFlags, default: DefaultValue) -> Self {
        self.keys.insert(
            key.to_string(),
            KeySpec {
                value_type,
                flags,
                default,
                normalizer: None,
                validator: None,
            },
        );
        self
    }

    pub fn normalize(mut self, key: &str, f: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        if let Some(entry) = self.keys.get_mut(key) {
            entry.normalizer = Some(Arc::new(f));
        }
        self
    }

    pub fn validate(
        mut self,
        key: &str,
        f: impl Fn(&Value, &dyn ConfigView) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        if let Some(entry) = self.keys.get_mut(key) {
            entry.validator = Some(Arc::new(f));
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&KeySpec> {
        self.keys.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown configuration key '{0}'")]
    UnknownKey(String),

    #[error("'{key}' must be {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("'{0}' is read-only and cannot be changed")]
    ReadOnly(String),

    #[error("'{0}' is required")]
    Missing(String),

    #[error("'{key}' is invalid: {message}")]
    Invalid { key: String, message: String },
}

/// Validated, not yet applied change
#[derive(Debug, Clone)]
pub struct PreparedChange {
    values: Map<String, Value>,
    effective: Map<String, Value>,
}

impl PreparedChange {
    /// Effective value of `key` after this change is committed
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.effective.get(key)
    }

    pub fn effective(&self) -> &Map<String, Value> {
        &self.effective
    }
}

pub struct ConfigStore {
    schema: Arc<Schema>,
    /// Explicitly set values
    values: Map<String, Value>,
    default_cache: Mutex<HashMap<String, Value>>,
    initialized: bool,
}

struct ValuesView<'a> {
    schema: &'a Schema,
    values: &'a Map<String, Value>,
    cache: Option<&'a Mutex<HashMap<String, Value>>>,
    depth: usize,
}

impl ConfigView for ValuesView<'_> {
    fn value(&self, key: &str) -> Option<Value> {
        if let Some(v) = self.values.get(key) {
            return Some(v.clone());
        }
        let entry = self.schema.get(key)?;
        // dynamic defaults may refer to each other; stop runaway recursion
        if self.depth > 8 {
            return None;
        }
        match &entry.default {
            DefaultValue::None => None,
            DefaultValue::Static(v) => Some(v.clone()),
            DefaultValue::Dynamic { compute, cache } => {
                if *cache {
                    if let Some(cached) = self.cache.and_then(|c| c.lock().get(key).cloned()) {
                        return Some(cached);
                    }
                }
                let nested = ValuesView {
                    schema: self.schema,
                    values: self.values,
                    cache: self.cache,
                    depth: self.depth + 1,
                };
                let value = compute(&nested);
                if *cache {
                    if let Some(c) = self.cache {
                        c.lock().insert(key.to_string(), value.clone());
                    }
                }
                Some(value)
            }
        }
    }
}

impl ConfigStore {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema: Arc::new(schema),
            values: Map::new(),
            default_cache: Mutex::new(HashMap::new()),
            initialized: false,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn view(&self) -> ValuesView<'_> {
        ValuesView {
            schema: &self.schema,
            values: &self.values,
            cache: Some(&self.default_cache),
            depth: 0,
        }
    }

    /// Effective value: the explicit value if set, else the default
    pub fn get(&self, key: &str) -> Option<Value> {
        self.view().value(key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.as_u64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(String::from))
    }

    /// Validate `updates`. A `null` value unsets the key, reverting it to its default.
    pub fn prepare(&self, updates: &Map<String, Value>) -> Result<PreparedChange, Vec<ConfigError>> {
        let mut errors = Vec::new();
        let mut values = self.values.clone();

        for (key, value) in updates {
            let Some(entry) = self.schema.get(key) else {
                errors.push(ConfigError::UnknownKey(key.clone()));
                continue;
            };

            if value.is_null() {
                if entry.flags.read_only && self.initialized && self.values.contains_key(key) {
                    errors.push(ConfigError::ReadOnly(key.clone()));
                } else {
                    values.remove(key);
                }
                continue;
            }

            if !entry.value_type.accepts(value) {
                errors.push(ConfigError::WrongType {
                    key: key.clone(),
                    expected: entry.value_type.name(),
                });
                continue;
            }

            let value = match &entry.normalizer {
                Some(normalize) => normalize(value.clone()),
                None => value.clone(),
            };

            if entry.flags.read_only && self.initialized && self.get(key).as_ref() != Some(&value) {
                errors.push(ConfigError::ReadOnly(key.clone()));
                continue;
            }

            values.insert(key.clone(), value);
        }

        // defaults are computed against the candidate values, without the live cache
        let candidate = ValuesView {
            schema: &self.schema,
            values: &values,
            cache: None,
            depth: 0,
        };

        let mut effective = Map::new();
        for (key, entry) in &self.schema.keys {
            match candidate.value(key) {
                Some(value) => {
                    effective.insert(key.clone(), value);
                }
                None if entry.flags.required => errors.push(ConfigError::Missing(key.clone())),
                None => {}
            }
        }

        for (key, entry) in &self.schema.keys {
            let (Some(validate), Some(value)) = (&entry.validator, effective.get(key)) else {
                continue;
            };
            let view = ValuesView {
                schema: &self.schema,
                values: &effective,
                cache: None,
                depth: 0,
            };
            if let Err(message) = validate(value, &view) {
                errors.push(ConfigError::Invalid {
                    key: key.clone(),
                    message,
                });
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(PreparedChange { values, effective })
    }

    pub fn commit(&mut self, change: PreparedChange) {
        self.values = change.values;
        self.default_cache.lock().clear();
        self.initialized = true;
    }

    /// Every key with its explicit, default and effective value. Secret values are masked.
    pub fn inspect(&self) -> Value {
        let view = self.view();
        let mut out = Map::new();
        for (key, entry) in &self.schema.keys {
            let mask = |v: Option<Value>| match v {
                Some(_) if entry.flags.secret => Value::String(FILTERED.to_string()),
                Some(v) => v,
                None => Value::Null,
            };
            let default = match &entry.default {
                DefaultValue::None => None,
                DefaultValue::Static(v) => Some(v.clone()),
                DefaultValue::Dynamic { .. } => {
                    let defaults_only = ValuesView {
                        schema: &self.schema,
                        values: &self.values,
                        cache: Some(&self.default_cache),
                        depth: 0,
                    };
                    if self.values.contains_key(key) {
                        None
                    } else {
                        defaults_only.value(key)
                    }
                }
            };
            let mut item = Map::new();
            item.insert("user_value".into(), mask(self.values.get(key).cloned()));
            item.insert("default_value".into(), mask(default));
            item.insert("value".into(), mask(view.value(key)));
            if entry.flags.read_only {
                item.insert("read_only".into(), Value::Bool(true));
            }
            out.insert(key.clone(), Value::Object(item));
        }
        Value::Object(out)
    }

    /// Effective values, secrets included
    pub fn effective(&self) -> Map<String, Value> {
        let view = self.view();
        self.schema
            .keys
            .keys()
            .filter_map(|key| view.value(key).map(|v| (key.clone(), v)))
            .collect()
    }

    /// Effective values with secrets masked
    pub fn dump(&self) -> Map<String, Value> {
        let view = self.view();
        let mut out = Map::new();
        for (key, entry) in &self.schema.keys {
            if let Some(value) = view.value(key) {
                let value = if entry.flags.secret {
                    Value::String(FILTERED.to_string())
                } else {
                    value
                };
                out.insert(key.clone(), value);
            }
        }
        out
    }
}

/// Schema of the server-level tunables
pub fn server_schema() -> Schema {
    let at_least_one = |v: &Value, _: &dyn ConfigView| {
        if v.as_u64().unwrap_or(0) >= 1 {
            Ok(())
        } else {
            Err("must be at least 1".to_string())
        }
    };

    Schema::new()
        .add("listen_address", ValueType::String, KeyFlags::REQUIRED.read_only(), DefaultValue::None)
        .add(
            "controller_threads",
            ValueType::Uint,
            KeyFlags::READ_ONLY,
            DefaultValue::cached(|_| {
                let n = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
                Value::from(n as u64)
            }),
        )
        .validate("controller_threads", at_least_one)
        .add("max_pool_size", ValueType::Uint, KeyFlags::NONE, DefaultValue::Static(Value::from(6u64)))
        .validate("max_pool_size", at_least_one)
        .add("pool_idle_time", ValueType::Uint, KeyFlags::NONE, DefaultValue::Static(Value::from(300u64)))
        .add(
            "group_quiet_period",
            ValueType::Uint,
            KeyFlags::NONE,
            DefaultValue::cached(|view| view.value("pool_idle_time").unwrap_or(Value::from(300u64))),
        )
        .add("detach_grace_period", ValueType::Uint, KeyFlags::NONE, DefaultValue::Static(Value::from(60u64)))
        .add("stat_throttle_rate", ValueType::Uint, KeyFlags::NONE, DefaultValue::Static(Value::from(10u64)))
        .add("turbocaching", ValueType::Bool, KeyFlags::NONE, DefaultValue::Static(Value::Bool(true)))
        .add(
            "heuristic_freshness_floor",
            ValueType::Uint,
            KeyFlags::NONE,
            DefaultValue::Static(Value::from(1u64)),
        )
        .add(
            "default_freshness",
            ValueType::Uint,
            KeyFlags::NONE,
            DefaultValue::Static(Value::from(10u64)),
        )
        .add(
            "max_session_checkout_try",
            ValueType::Uint,
            KeyFlags::NONE,
            DefaultValue::Static(Value::from(10u64)),
        )
        .validate("max_session_checkout_try", at_least_one)
        .add(
            "body_buffer_threshold",
            ValueType::Uint,
            KeyFlags::NONE,
            DefaultValue::Static(Value::from(128u64 * 1024)),
        )
        .add(
            "sticky_sessions_cookie_name",
            ValueType::String,
            KeyFlags::NONE,
            DefaultValue::Static(Value::from("_appgate_route")),
        )
        .normalize("sticky_sessions_cookie_name", |v| match v.as_str() {
            Some(s) => Value::from(s.trim()),
            None => v,
        })
        .validate("sticky_sessions_cookie_name", |v, _| {
            let name = v.as_str().unwrap_or("");
            if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
                Ok(())
            } else {
                Err("must be a non-empty cookie token".to_string())
            }
        })
        .add(
            "default_friendly_error_pages",
            ValueType::String,
            KeyFlags::NONE,
            DefaultValue::Static(Value::from("auto")),
        )
        .normalize("default_friendly_error_pages", |v| match v.as_str() {
            Some(s) => Value::from(s.trim().to_ascii_lowercase()),
            None => v,
        })
        .validate("default_friendly_error_pages", |v, _| match v.as_str() {
            Some("auto") | Some("true") | Some("false") => Ok(()),
            _ => Err("must be one of auto, true, false".to_string()),
        })
        .add("self_checking", ValueType::Bool, KeyFlags::NONE, DefaultValue::Static(Value::Bool(false)))
        .add("api_key", ValueType::String, KeyFlags::SECRET, DefaultValue::None)
        .add("secure_headers_password", ValueType::String, KeyFlags::SECRET, DefaultValue::None)
        .add(
            "server_software",
            ValueType::String,
            KeyFlags::NONE,
            DefaultValue::dynamic(|_| Value::from(format!("appgate/{}", env!("CARGO_PKG_VERSION")))),
        )
}
