//! Per-channel configuration and its self-describing schema.
//!
//! A [`ChannelConfig`] is the opaque map the config provider hands to a
//! channel: an `enabled` flag plus channel-specific fields. Drivers publish a
//! [`ConfigSchema`] describing those fields; the schema is used both for
//! validation at `initialize` time and by UI/CLI collaborators that render
//! configuration forms.
//!
//! # Example
//!
//! ```rust,ignore
//! let schema = ConfigSchema::new()
//!     .field(ConfigField::string("app_id", "Bot application id").required())
//!     .field(ConfigField::string("client_secret", "Bot secret").required().secret())
//!     .field(ConfigField::enumeration("dm_policy", "DM access", &["open", "allowlist", "disabled"]));
//!
//! let issues = schema.validate(&config);
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn default_enabled() -> bool {
    true
}

/// Configuration for a single channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Whether the channel should be started by bulk operations.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Channel-specific settings.
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            settings: Map::new(),
        }
    }
}

impl ChannelConfig {
    /// Creates an empty, enabled configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the enabled flag.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets a setting.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// Returns a setting.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    /// Returns a string setting.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(Value::as_str)
    }

    /// Deserializes the settings into a typed configuration.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.settings.clone()))
    }
}

// =============================================================================
// Schema
// =============================================================================

/// Type of a configuration field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum FieldKind {
    /// Free-form string.
    String,
    /// `true` / `false`.
    Boolean,
    /// Whole number.
    Integer,
    /// Array of strings.
    StringList,
    /// One of a fixed set of strings.
    Enum(Vec<String>),
}

impl FieldKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Boolean => value.is_boolean(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            Self::Enum(values) => value.as_str().is_some_and(|v| values.iter().any(|e| e == v)),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::String => "a string".into(),
            Self::Boolean => "a boolean".into(),
            Self::Integer => "an integer".into(),
            Self::StringList => "a list of strings".into(),
            Self::Enum(values) => format!("one of [{}]", values.join(", ")),
        }
    }
}

/// Description of one configuration field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigField {
    /// Key in the settings map.
    pub name: String,
    /// Expected value type.
    #[serde(flatten)]
    pub kind: FieldKind,
    /// Human-readable description.
    pub description: String,
    /// Whether the field must be present and non-empty.
    #[serde(default)]
    pub required: bool,
    /// Whether the value is a credential that UIs should mask.
    #[serde(default)]
    pub secret: bool,
    /// Value used when the field is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ConfigField {
    fn new(name: &str, kind: FieldKind, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            description: description.to_string(),
            required: false,
            secret: false,
            default: None,
        }
    }

    /// A string field.
    pub fn string(name: &str, description: &str) -> Self {
        Self::new(name, FieldKind::String, description)
    }

    /// A boolean field.
    pub fn boolean(name: &str, description: &str) -> Self {
        Self::new(name, FieldKind::Boolean, description)
    }

    /// An integer field.
    pub fn integer(name: &str, description: &str) -> Self {
        Self::new(name, FieldKind::Integer, description)
    }

    /// A list-of-strings field.
    pub fn string_list(name: &str, description: &str) -> Self {
        Self::new(name, FieldKind::StringList, description)
    }

    /// A field restricted to the given values.
    pub fn enumeration(name: &str, description: &str, values: &[&str]) -> Self {
        let values = values.iter().map(|v| (*v).to_string()).collect();
        Self::new(name, FieldKind::Enum(values), description)
    }

    /// Marks the field as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Marks the field as a secret.
    pub fn secret(mut self) -> Self {
        self.secret = true;
        self
    }

    /// Sets the default value.
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// Schema of a channel's configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSchema {
    /// Known fields, in display order.
    pub fields: Vec<ConfigField>,
}

impl ConfigSchema {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field.
    pub fn field(mut self, field: ConfigField) -> Self {
        self.fields.push(field);
        self
    }

    /// Looks up a field by name.
    pub fn get(&self, name: &str) -> Option<&ConfigField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validates a configuration, returning every issue found.
    ///
    /// Unknown keys are accepted so that newer configs keep working with
    /// older channel versions.
    pub fn validate(&self, config: &ChannelConfig) -> Vec<String> {
        let mut issues = Vec::new();

        for field in &self.fields {
            match config.get(&field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        issues.push(format!("{} is required", field.name));
                    }
                }
                Some(value) => {
                    if !field.kind.accepts(value) {
                        issues.push(format!(
                            "{} must be {}",
                            field.name,
                            field.kind.describe()
                        ));
                    } else if field.required && value.as_str().is_some_and(|s| s.trim().is_empty())
                    {
                        issues.push(format!("{} must not be empty", field.name));
                    }
                }
            }
        }

        issues
    }
}
