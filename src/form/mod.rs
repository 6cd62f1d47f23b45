//! Form element model.
//!
//! `FormElement` serializes in camelCase so the JSON written to the document
//! and to the forms API is identical to what the browser editor produces.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Stable identifier of one element within a form
pub type ElementId = String;

/// Identifier of a form, assigned by the forms API
pub type FormId = String;

/// Errors raised by element mutations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormError {
    #[error("Column span must be 1, 2 or 3, got {0}")]
    InvalidColSpan(u8),

    #[error("Unknown field type: {0}")]
    UnknownFieldType(String),

    #[error("Invalid value for property {key}: {reason}")]
    InvalidProperty { key: String, reason: String },

    #[error("Element not found: {0}")]
    ElementNotFound(ElementId),
}

/// Kind of field an element renders as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Input,
    Number,
    Button,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Input => "input",
            FieldType::Number => "number",
            FieldType::Button => "button",
        }
    }

    /// Label given to freshly added elements
    pub fn default_label(self) -> &'static str {
        match self {
            FieldType::Input => "Input",
            FieldType::Number => "Number",
            FieldType::Button => "Button",
        }
    }
}

impl std::str::FromStr for FieldType {
    type Err = FormError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input" => Ok(FieldType::Input),
            "number" => Ok(FieldType::Number),
            "button" => Ok(FieldType::Button),
            other => Err(FormError::UnknownFieldType(other.to_string())),
        }
    }
}

/// Grid width of an element, 1 to 3 columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ColSpan(u8);

impl ColSpan {
    pub const ONE: ColSpan = ColSpan(1);
    pub const TWO: ColSpan = ColSpan(2);
    pub const THREE: ColSpan = ColSpan(3);

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for ColSpan {
    fn default() -> Self {
        ColSpan::ONE
    }
}

impl TryFrom<u8> for ColSpan {
    type Error = FormError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1..=3 => Ok(ColSpan(value)),
            other => Err(FormError::InvalidColSpan(other)),
        }
    }
}

impl From<ColSpan> for u8 {
    fn from(span: ColSpan) -> Self {
        span.0
    }
}

/// One field on a form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormElement {
    pub id: ElementId,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    pub col_span: ColSpan,
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// Opaque rule payload, carried without interpretation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility_rules: Option<Vec<Value>>,
}

impl FormElement {
    /// A new element with a fresh id and the type's default label
    pub fn new(field_type: FieldType) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), field_type)
    }

    pub fn with_id(id: impl Into<ElementId>, field_type: FieldType) -> Self {
        Self {
            id: id.into(),
            field_type,
            label: field_type.default_label().to_string(),
            placeholder: None,
            required: None,
            col_span: ColSpan::ONE,
            properties: Map::new(),
            visibility_rules: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Write one editor property.
    ///
    /// `label`, `placeholder`, `required` and `visibilityRules` are top-level
    /// fields; any other key lands in `properties`. `null` clears optional
    /// top-level fields.
    pub fn apply_property(&mut self, key: &str, value: Value) -> Result<(), FormError> {
        let invalid = |reason: &str| FormError::InvalidProperty {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        match key {
            "label" => match value {
                Value::String(label) => self.label = label,
                _ => return Err(invalid("expected a string")),
            },
            "placeholder" => match value {
                Value::String(text) => self.placeholder = Some(text),
                Value::Null => self.placeholder = None,
                _ => return Err(invalid("expected a string or null")),
            },
            "required" => match value {
                Value::Bool(flag) => self.required = Some(flag),
                Value::Null => self.required = None,
                _ => return Err(invalid("expected a boolean or null")),
            },
            "visibilityRules" => match value {
                Value::Array(rules) => self.visibility_rules = Some(rules),
                Value::Null => self.visibility_rules = None,
                _ => return Err(invalid("expected an array or null")),
            },
            _ => {
                self.properties.insert(key.to_string(), value);
            }
        }
        Ok(())
    }
}

/// Name of a relay room
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomKey(String);

impl RoomKey {
    /// Room carrying a form's replicated element list
    pub fn form(form_id: &str) -> Self {
        Self(format!("form-{}", form_id))
    }

    /// Room carrying presence for a canvas
    pub fn awareness(canvas_id: &str) -> Self {
        Self(format!("awareness-{}", canvas_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RoomKey {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<&str> for RoomKey {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl std::fmt::Display for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_element_defaults() {
        let element = FormElement::new(FieldType::Number);
        assert_eq!(element.label, "Number");
        assert_eq!(element.col_span, ColSpan::ONE);
        assert!(element.properties.is_empty());
        assert!(!element.id.is_empty());
    }

    #[test]
    fn test_serializes_in_editor_shape() {
        let mut element = FormElement::with_id("e1", FieldType::Input);
        element.required = Some(true);

        let value = serde_json::to_value(&element).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "e1",
                "type": "input",
                "label": "Input",
                "required": true,
                "colSpan": 1,
                "properties": {}
            })
        );
    }

    #[test]
    fn test_visibility_rules_pass_through_untouched() {
        let raw = json!({
            "id": "e2",
            "type": "button",
            "label": "Submit",
            "colSpan": 3,
            "properties": {"variant": "primary"},
            "visibilityRules": [{"field": "e1", "op": "eq", "value": 4, "nested": {"x": [1, null]}}]
        });

        let element: FormElement = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(element.col_span.get(), 3);
        assert_eq!(serde_json::to_value(&element).unwrap(), raw);
    }

    #[test]
    fn test_rejects_out_of_range_col_span() {
        let raw = json!({"id": "x", "type": "input", "label": "X", "colSpan": 4, "properties": {}});
        assert!(serde_json::from_value::<FormElement>(raw).is_err());
        assert_eq!(ColSpan::try_from(0), Err(FormError::InvalidColSpan(0)));
    }

    #[test]
    fn test_apply_property_routes_keys() {
        let mut element = FormElement::with_id("e1", FieldType::Input);

        element.apply_property("label", json!("Email")).unwrap();
        element.apply_property("placeholder", json!("you@example.com")).unwrap();
        element.apply_property("maxLength", json!(64)).unwrap();
        element.apply_property("placeholder", Value::Null).unwrap();

        assert_eq!(element.label, "Email");
        assert_eq!(element.placeholder, None);
        assert_eq!(element.properties.get("maxLength"), Some(&json!(64)));

        let err = element.apply_property("required", json!("yes")).unwrap_err();
        assert!(matches!(err, FormError::InvalidProperty { .. }));
    }

    #[test]
    fn test_room_keys() {
        assert_eq!(RoomKey::form("abc").as_str(), "form-abc");
        assert_eq!(RoomKey::awareness("main").to_string(), "awareness-main");
        assert_eq!("form-abc".parse::<FieldType>().ok(), None);
    }
}
