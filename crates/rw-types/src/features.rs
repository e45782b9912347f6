//! Concrete values of tunable ranking parameters.
//!
//! A [`Feature`] is one immutable value of a tunable parameter. Its name is
//! the key it is stored under in an [`crate::Experiment`], which is also the
//! name of the [`crate::FeatureFactory`] that governs it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A field with an optional boost. An unset weight is assigned by the
/// governing factory on the next `random` or `mutate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedField {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

impl WeightedField {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            weight: None,
        }
    }

    pub fn weighted(field: impl Into<String>, weight: f64) -> Self {
        Self {
            field: field.into(),
            weight: Some(weight),
        }
    }
}

impl fmt::Display for WeightedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.weight {
            Some(weight) => write!(f, "{}^{}", self.field, format_number(weight)),
            None => write!(f, "{}", self.field),
        }
    }
}

/// A parameterizable string: a template plus the numeric vector bound into
/// its `{0}`, `{1}`, ... placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateValue {
    pub id: String,
    pub template: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<f64>,
}

impl TemplateValue {
    pub fn new(id: impl Into<String>, template: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            id: id.into(),
            template: template.into(),
            values,
        }
    }

    /// Bind the numeric vector into the template. Placeholders without a
    /// value are left as-is.
    pub fn render(&self) -> String {
        let mut rendered = self.template.clone();
        for (i, value) in self.values.iter().enumerate() {
            rendered = rendered.replace(&format!("{{{i}}}"), &format_number(*value));
        }
        rendered
    }
}

impl fmt::Display for TemplateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// One concrete value of a tunable parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Feature {
    /// Ordered field list, e.g. `qf` / `pf`.
    WeightedFields(Vec<WeightedField>),
    /// Single float, e.g. `tie` or a phrase slop.
    Float(f64),
    /// One of an enumerated set of strings, e.g. `q.op` or `mm`.
    Choice(String),
    Template(TemplateValue),
    TemplateList(Vec<TemplateValue>),
}

impl Feature {
    /// Discriminator used in serialized form and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WeightedFields(_) => "weighted_fields",
            Self::Float(_) => "float",
            Self::Choice(_) => "choice",
            Self::Template(_) => "template",
            Self::TemplateList(_) => "template_list",
        }
    }

    /// Rendered form handed to the search backend.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WeightedFields(fields) => write_joined(f, fields),
            Self::Float(v) => f.write_str(&format_number(*v)),
            Self::Choice(s) => f.write_str(s),
            Self::Template(t) => write!(f, "{t}"),
            Self::TemplateList(templates) => write_joined(f, templates),
        }
    }
}

fn write_joined<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(" ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

/// Format a float with at most four decimals and no trailing zeros.
pub fn format_number(value: f64) -> String {
    let formatted = format!("{value:.4}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-" || trimmed == "-0" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_fields_render_solr_style() {
        let feature = Feature::WeightedFields(vec![
            WeightedField::weighted("title", 2.5),
            WeightedField::new("body"),
            WeightedField::weighted("tags", 1.0),
        ]);
        assert_eq!(feature.render(), "title^2.5 body tags^1");
    }

    #[test]
    fn format_number_trims() {
        assert_eq!(format_number(0.30000000000000004), "0.3");
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(0.0), "0");
        assert_eq!(format_number(-0.00001), "0");
        assert_eq!(format_number(1.23456), "1.2346");
    }

    #[test]
    fn template_binds_placeholders() {
        let t = TemplateValue::new("recency", "recip(ms(NOW,date),3.16e-11,{0},{1})", vec![1.0, 0.5]);
        assert_eq!(t.render(), "recip(ms(NOW,date),3.16e-11,1,0.5)");

        let partial = TemplateValue::new("p", "{0} {1}", vec![2.0]);
        assert_eq!(partial.render(), "2 {1}");
    }

    #[test]
    fn template_list_joins_with_space() {
        let feature = Feature::TemplateList(vec![
            TemplateValue::new("a", "log(popularity)^{0}", vec![2.0]),
            TemplateValue::new("b", "sqrt(rank)", vec![]),
        ]);
        assert_eq!(feature.to_string(), "log(popularity)^2 sqrt(rank)");
    }

    #[test]
    fn serialized_shape_is_tagged() {
        let feature = Feature::Float(0.3);
        let json = serde_json::to_value(&feature).unwrap();
        assert_eq!(json, serde_json::json!({"type": "float", "value": 0.3}));

        let choice: Feature =
            serde_json::from_value(serde_json::json!({"type": "choice", "value": "AND"})).unwrap();
        assert_eq!(choice, Feature::Choice("AND".to_string()));
        assert_eq!(choice.kind(), "choice");
    }

    #[test]
    fn unknown_discriminator_is_rejected() {
        let result: Result<Feature, _> =
            serde_json::from_value(serde_json::json!({"type": "integer", "value": 3}));
        assert!(result.is_err());
    }
}
