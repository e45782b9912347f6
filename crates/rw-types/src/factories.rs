//! Feature factories: the legal domain of each tunable parameter and the
//! default / random / mutate / permute operations over it.
//!
//! Factories are a closed set selected by the `"type"` discriminator in
//! config. Crossover is deliberately absent here; it swaps whole features
//! between experiments and lives with the optimizer.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::RwResult;
use crate::features::{Feature, TemplateValue, WeightedField};
use crate::{config_error, RwError};

/// Parameter names owned by the query itself.
pub const RESERVED_PARAMETERS: [&str; 2] = ["q", "fq"];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_PARAMETERS.contains(&name)
}

fn default_min_set_size() -> usize {
    1
}

// ---------------------------------------------------------------------------
// Sampling helpers
// ---------------------------------------------------------------------------

fn uniform<R: Rng + ?Sized>(rng: &mut R, min: f64, max: f64) -> f64 {
    if max > min {
        rng.gen_range(min..=max)
    } else {
        min
    }
}

fn hit<R: Rng + ?Sized>(rng: &mut R, probability: f64) -> bool {
    probability > 0.0 && rng.gen::<f64>() < probability
}

/// Draw from a window centred on `value` whose half-width is
/// `amplitude * distance-to-bound`, clamped to `[min, max]`.
fn window_sample<R: Rng + ?Sized>(rng: &mut R, value: f64, min: f64, max: f64, amplitude: f64) -> f64 {
    let half_width = amplitude.max(0.0) * (value - min).max(max - value);
    let low = (value - half_width).max(min);
    let high = (value + half_width).min(max);
    if high > low {
        rng.gen_range(low..=high)
    } else {
        value
    }
}

/// Random subset of `0..len` with size in `[min_size, max_size]`, in ascending order.
fn random_subset<R: Rng + ?Sized>(rng: &mut R, len: usize, min_size: usize, max_size: usize) -> Vec<usize> {
    let upper = max_size.min(len);
    let lower = min_size.min(upper);
    let size = if upper > lower {
        rng.gen_range(lower..=upper)
    } else {
        upper
    };
    let mut picked = rand::seq::index::sample(rng, len, size).into_vec();
    picked.sort_unstable();
    picked
}

/// Depth-first enumeration: each item is either omitted or included in one of
/// its alternatives. Complete assignments sized within bounds are collected
/// until `max_count` results exist.
fn permute_subsets<T: Clone>(
    alternatives: &[Vec<T>],
    min_size: usize,
    max_size: usize,
    max_count: usize,
) -> Vec<Vec<T>> {
    fn descend<T: Clone>(
        idx: usize,
        alternatives: &[Vec<T>],
        bounds: (usize, usize),
        max_count: usize,
        current: &mut Vec<T>,
        out: &mut Vec<Vec<T>>,
    ) {
        if out.len() >= max_count || current.len() > bounds.1 {
            return;
        }
        if idx == alternatives.len() {
            if !current.is_empty() && current.len() >= bounds.0 {
                out.push(current.clone());
            }
            return;
        }
        descend(idx + 1, alternatives, bounds, max_count, current, out);
        for alt in &alternatives[idx] {
            if out.len() >= max_count {
                return;
            }
            current.push(alt.clone());
            descend(idx + 1, alternatives, bounds, max_count, current, out);
            current.pop();
        }
    }

    let mut out = Vec::new();
    let mut current = Vec::new();
    descend(0, alternatives, (min_size, max_size), max_count, &mut current, &mut out);
    out
}

// ---------------------------------------------------------------------------
// Weighted field lists
// ---------------------------------------------------------------------------

/// Field list with boosts, e.g. `qf`. Weight bounds are observed from the
/// declared default weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedFieldsFactory {
    pub fields: Vec<String>,
    pub default_weights: Vec<f64>,
    #[serde(default = "default_min_set_size")]
    pub min_set_size: usize,
    #[serde(default)]
    pub max_set_size: Option<usize>,
}

impl WeightedFieldsFactory {
    pub fn new(fields: Vec<String>, default_weights: Vec<f64>) -> Self {
        Self {
            fields,
            default_weights,
            min_set_size: 1,
            max_set_size: None,
        }
    }

    pub fn with_set_size(mut self, min: usize, max: usize) -> Self {
        self.min_set_size = min;
        self.max_set_size = Some(max);
        self
    }

    /// Observed `[min, max]` over the declared default weights.
    pub fn weight_bounds(&self) -> (f64, f64) {
        let min = self.default_weights.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self.default_weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if min.is_finite() && max.is_finite() {
            (min, max)
        } else {
            (1.0, 1.0)
        }
    }

    fn max_size(&self) -> usize {
        self.max_set_size.unwrap_or(self.fields.len()).min(self.fields.len())
    }

    fn validate(&self, name: &str) -> RwResult<()> {
        if self.fields.is_empty() {
            return Err(config_error!("{name}: weighted field list declares no fields"));
        }
        if self.default_weights.is_empty() {
            return Err(config_error!("{name}: weighted field list declares no default weights"));
        }
        if self.default_weights.iter().any(|w| !w.is_finite()) {
            return Err(config_error!("{name}: default weights must be finite"));
        }
        if self.min_set_size > self.max_size() {
            return Err(config_error!(
                "{name}: minSetSize {} exceeds maxSetSize {}",
                self.min_set_size,
                self.max_size()
            ));
        }
        Ok(())
    }

    pub fn default_value(&self) -> Vec<WeightedField> {
        let weight = self.default_weights.first().copied();
        self.fields
            .iter()
            .map(|field| WeightedField {
                field: field.clone(),
                weight,
            })
            .collect()
    }

    pub fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<WeightedField> {
        let (min, max) = self.weight_bounds();
        random_subset(rng, self.fields.len(), self.min_set_size.max(1), self.max_size())
            .into_iter()
            .map(|i| WeightedField::weighted(self.fields[i].clone(), uniform(rng, min, max)))
            .collect()
    }

    pub fn mutate<R: Rng + ?Sized>(
        &self,
        value: &[WeightedField],
        probability: f64,
        amplitude: f64,
        rng: &mut R,
    ) -> Vec<WeightedField> {
        let (min, max) = self.weight_bounds();
        if min == max {
            return value.to_vec();
        }
        value
            .iter()
            .map(|wf| {
                let weight = match wf.weight {
                    None => uniform(rng, min, max),
                    Some(w) if hit(rng, probability) => window_sample(rng, w, min, max, amplitude),
                    Some(w) => w,
                };
                WeightedField::weighted(wf.field.clone(), weight)
            })
            .collect()
    }

    pub fn permute(&self, max_count: usize) -> Vec<Vec<WeightedField>> {
        let alternatives: Vec<Vec<WeightedField>> = self
            .fields
            .iter()
            .map(|field| {
                self.default_weights
                    .iter()
                    .map(|w| WeightedField::weighted(field.clone(), *w))
                    .collect()
            })
            .collect();
        permute_subsets(&alternatives, self.min_set_size.max(1), self.max_size(), max_count)
    }
}

// ---------------------------------------------------------------------------
// Floats and choices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatFactory {
    pub min: f64,
    pub max: f64,
    /// Grid used by `permute`; `min` and `max` when empty.
    #[serde(default)]
    pub values: Vec<f64>,
    #[serde(default)]
    pub default: Option<f64>,
}

impl FloatFactory {
    pub fn new(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            values: Vec::new(),
            default: None,
        }
    }

    pub fn with_values(mut self, values: Vec<f64>) -> Self {
        self.values = values;
        self
    }

    fn validate(&self, name: &str) -> RwResult<()> {
        if !(self.min.is_finite() && self.max.is_finite()) || self.min > self.max {
            return Err(config_error!("{name}: invalid float range [{}, {}]", self.min, self.max));
        }
        Ok(())
    }

    pub fn default_value(&self) -> f64 {
        self.default
            .or_else(|| self.values.first().copied())
            .unwrap_or(self.min)
    }

    pub fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        uniform(rng, self.min, self.max)
    }

    pub fn mutate<R: Rng + ?Sized>(&self, value: f64, probability: f64, amplitude: f64, rng: &mut R) -> f64 {
        if hit(rng, probability) {
            window_sample(rng, value, self.min, self.max, amplitude)
        } else {
            value
        }
    }

    pub fn permute(&self, max_count: usize) -> Vec<f64> {
        let grid = if self.values.is_empty() {
            if self.min == self.max {
                vec![self.min]
            } else {
                vec![self.min, self.max]
            }
        } else {
            self.values.clone()
        };
        grid.into_iter().take(max_count).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceFactory {
    pub values: Vec<String>,
}

impl ChoiceFactory {
    pub fn new(values: Vec<String>) -> Self {
        Self { values }
    }

    fn validate(&self, name: &str) -> RwResult<()> {
        if self.values.is_empty() {
            return Err(config_error!("{name}: choice declares no values"));
        }
        Ok(())
    }

    pub fn default_value(&self) -> String {
        self.values.first().cloned().unwrap_or_default()
    }

    pub fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        self.values.choose(rng).cloned().unwrap_or_default()
    }

    /// Resample uniformly with `probability`. A zero amplitude leaves the value alone.
    pub fn mutate<R: Rng + ?Sized>(&self, value: &str, probability: f64, amplitude: f64, rng: &mut R) -> String {
        if amplitude > 0.0 && hit(rng, probability) {
            self.random(rng)
        } else {
            value.to_string()
        }
    }

    pub fn permute(&self, max_count: usize) -> Vec<String> {
        self.values.iter().take(max_count).cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Legal range of one numeric template parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamRange {
    pub min: f64,
    pub max: f64,
    #[serde(default)]
    pub default: Option<f64>,
}

impl ParamRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max, default: None }
    }

    pub fn default_value(&self) -> f64 {
        self.default.unwrap_or((self.min + self.max) / 2.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub id: String,
    pub template: String,
    #[serde(default)]
    pub params: Vec<ParamRange>,
}

impl TemplateSpec {
    pub fn new(id: impl Into<String>, template: impl Into<String>, params: Vec<ParamRange>) -> Self {
        Self {
            id: id.into(),
            template: template.into(),
            params,
        }
    }

    fn default_value(&self) -> TemplateValue {
        TemplateValue::new(
            self.id.clone(),
            self.template.clone(),
            self.params.iter().map(ParamRange::default_value).collect(),
        )
    }

    fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> TemplateValue {
        TemplateValue::new(
            self.id.clone(),
            self.template.clone(),
            self.params.iter().map(|p| uniform(rng, p.min, p.max)).collect(),
        )
    }

    fn mutate<R: Rng + ?Sized>(
        &self,
        value: &TemplateValue,
        probability: f64,
        amplitude: f64,
        rng: &mut R,
    ) -> TemplateValue {
        let values = self
            .params
            .iter()
            .enumerate()
            .map(|(i, range)| {
                let current = value.values.get(i).copied().unwrap_or_else(|| range.default_value());
                if hit(rng, probability) {
                    window_sample(rng, current, range.min, range.max, amplitude)
                } else {
                    current
                }
            })
            .collect();
        TemplateValue::new(self.id.clone(), self.template.clone(), values)
    }

    fn validate(&self, name: &str) -> RwResult<()> {
        for range in &self.params {
            if !(range.min.is_finite() && range.max.is_finite()) || range.min > range.max {
                return Err(config_error!(
                    "{name}: template {} has invalid range [{}, {}]",
                    self.id,
                    range.min,
                    range.max
                ));
            }
        }
        Ok(())
    }
}

fn mutate_template<R: Rng + ?Sized>(
    templates: &[TemplateSpec],
    value: &TemplateValue,
    probability: f64,
    amplitude: f64,
    rng: &mut R,
) -> TemplateValue {
    match templates.iter().find(|t| t.id == value.id) {
        Some(spec) => spec.mutate(value, probability, amplitude, rng),
        None if amplitude > 0.0 && hit(rng, probability) => match templates.choose(rng) {
            Some(spec) => spec.random(rng),
            None => value.clone(),
        },
        None => value.clone(),
    }
}

/// One template chosen from a declared set, e.g. a boost function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateFactory {
    pub templates: Vec<TemplateSpec>,
}

impl TemplateFactory {
    pub fn new(templates: Vec<TemplateSpec>) -> Self {
        Self { templates }
    }

    fn validate(&self, name: &str) -> RwResult<()> {
        if self.templates.is_empty() {
            return Err(config_error!("{name}: template factory declares no templates"));
        }
        self.templates.iter().try_for_each(|t| t.validate(name))
    }

    pub fn default_value(&self) -> Option<TemplateValue> {
        self.templates.first().map(TemplateSpec::default_value)
    }

    pub fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<TemplateValue> {
        self.templates.choose(rng).map(|t| t.random(rng))
    }

    pub fn mutate<R: Rng + ?Sized>(
        &self,
        value: &TemplateValue,
        probability: f64,
        amplitude: f64,
        rng: &mut R,
    ) -> TemplateValue {
        mutate_template(&self.templates, value, probability, amplitude, rng)
    }

    pub fn permute(&self, max_count: usize) -> Vec<TemplateValue> {
        self.templates
            .iter()
            .take(max_count)
            .map(TemplateSpec::default_value)
            .collect()
    }
}

/// A subset of declared templates, e.g. several `bf` functions at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateListFactory {
    pub templates: Vec<TemplateSpec>,
    #[serde(default = "default_min_set_size")]
    pub min_set_size: usize,
    #[serde(default)]
    pub max_set_size: Option<usize>,
}

impl TemplateListFactory {
    pub fn new(templates: Vec<TemplateSpec>) -> Self {
        Self {
            templates,
            min_set_size: 1,
            max_set_size: None,
        }
    }

    fn max_size(&self) -> usize {
        self.max_set_size.unwrap_or(self.templates.len()).min(self.templates.len())
    }

    fn validate(&self, name: &str) -> RwResult<()> {
        if self.templates.is_empty() {
            return Err(config_error!("{name}: template list declares no templates"));
        }
        if self.min_set_size > self.max_size() {
            return Err(config_error!(
                "{name}: minSetSize {} exceeds maxSetSize {}",
                self.min_set_size,
                self.max_size()
            ));
        }
        self.templates.iter().try_for_each(|t| t.validate(name))
    }

    pub fn default_value(&self) -> Vec<TemplateValue> {
        self.templates
            .iter()
            .take(self.min_set_size.max(1))
            .map(TemplateSpec::default_value)
            .collect()
    }

    pub fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<TemplateValue> {
        random_subset(rng, self.templates.len(), self.min_set_size.max(1), self.max_size())
            .into_iter()
            .map(|i| self.templates[i].random(rng))
            .collect()
    }

    pub fn mutate<R: Rng + ?Sized>(
        &self,
        value: &[TemplateValue],
        probability: f64,
        amplitude: f64,
        rng: &mut R,
    ) -> Vec<TemplateValue> {
        value
            .iter()
            .map(|t| mutate_template(&self.templates, t, probability, amplitude, rng))
            .collect()
    }

    pub fn permute(&self, max_count: usize) -> Vec<Vec<TemplateValue>> {
        let alternatives: Vec<Vec<TemplateValue>> = self
            .templates
            .iter()
            .map(|t| vec![t.default_value()])
            .collect();
        permute_subsets(&alternatives, self.min_set_size.max(1), self.max_size(), max_count)
    }
}

// ---------------------------------------------------------------------------
// Tagged registry
// ---------------------------------------------------------------------------

/// The closed set of factory kinds, selected by `"type"` in config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeatureFactory {
    WeightedFields(WeightedFieldsFactory),
    Float(FloatFactory),
    Choice(ChoiceFactory),
    Template(TemplateFactory),
    TemplateList(TemplateListFactory),
}

impl FeatureFactory {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WeightedFields(_) => "weighted_fields",
            Self::Float(_) => "float",
            Self::Choice(_) => "choice",
            Self::Template(_) => "template",
            Self::TemplateList(_) => "template_list",
        }
    }

    pub fn validate(&self, name: &str) -> RwResult<()> {
        if is_reserved(name) {
            return Err(config_error!("'{name}' is reserved and cannot be a tunable parameter"));
        }
        match self {
            Self::WeightedFields(f) => f.validate(name),
            Self::Float(f) => f.validate(name),
            Self::Choice(f) => f.validate(name),
            Self::Template(f) => f.validate(name),
            Self::TemplateList(f) => f.validate(name),
        }
    }

    pub fn default_value(&self) -> RwResult<Feature> {
        Ok(match self {
            Self::WeightedFields(f) => Feature::WeightedFields(f.default_value()),
            Self::Float(f) => Feature::Float(f.default_value()),
            Self::Choice(f) => Feature::Choice(f.default_value()),
            Self::Template(f) => Feature::Template(
                f.default_value()
                    .ok_or_else(|| config_error!("template factory declares no templates"))?,
            ),
            Self::TemplateList(f) => Feature::TemplateList(f.default_value()),
        })
    }

    pub fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> RwResult<Feature> {
        Ok(match self {
            Self::WeightedFields(f) => Feature::WeightedFields(f.random(rng)),
            Self::Float(f) => Feature::Float(f.random(rng)),
            Self::Choice(f) => Feature::Choice(f.random(rng)),
            Self::Template(f) => Feature::Template(
                f.random(rng)
                    .ok_or_else(|| config_error!("template factory declares no templates"))?,
            ),
            Self::TemplateList(f) => Feature::TemplateList(f.random(rng)),
        })
    }

    /// Produce a new value; the input is never modified. The value must be of
    /// this factory's kind.
    pub fn mutate<R: Rng + ?Sized>(
        &self,
        value: &Feature,
        probability: f64,
        amplitude: f64,
        rng: &mut R,
    ) -> RwResult<Feature> {
        Ok(match (self, value) {
            (Self::WeightedFields(f), Feature::WeightedFields(v)) => {
                Feature::WeightedFields(f.mutate(v, probability, amplitude, rng))
            }
            (Self::Float(f), Feature::Float(v)) => Feature::Float(f.mutate(*v, probability, amplitude, rng)),
            (Self::Choice(f), Feature::Choice(v)) => Feature::Choice(f.mutate(v, probability, amplitude, rng)),
            (Self::Template(f), Feature::Template(v)) => {
                Feature::Template(f.mutate(v, probability, amplitude, rng))
            }
            (Self::TemplateList(f), Feature::TemplateList(v)) => {
                Feature::TemplateList(f.mutate(v, probability, amplitude, rng))
            }
            (factory, value) => {
                return Err(config_error!(
                    "{} factory cannot mutate a {} value",
                    factory.kind(),
                    value.kind()
                ))
            }
        })
    }

    pub fn permute(&self, max_count: usize) -> Vec<Feature> {
        match self {
            Self::WeightedFields(f) => f.permute(max_count).into_iter().map(Feature::WeightedFields).collect(),
            Self::Float(f) => f.permute(max_count).into_iter().map(Feature::Float).collect(),
            Self::Choice(f) => f.permute(max_count).into_iter().map(Feature::Choice).collect(),
            Self::Template(f) => f.permute(max_count).into_iter().map(Feature::Template).collect(),
            Self::TemplateList(f) => f.permute(max_count).into_iter().map(Feature::TemplateList).collect(),
        }
    }
}

/// All factories of a tuning run, keyed by parameter name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureFactories {
    factories: BTreeMap<String, FeatureFactory>,
}

impl FeatureFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert; rejects reserved names and invalid domains.
    pub fn with(mut self, name: impl Into<String>, factory: FeatureFactory) -> RwResult<Self> {
        self.insert(name, factory)?;
        Ok(self)
    }

    pub fn insert(&mut self, name: impl Into<String>, factory: FeatureFactory) -> RwResult<()> {
        let name = name.into();
        factory.validate(&name)?;
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Check every factory; used after deserialization.
    pub fn validate(&self) -> RwResult<()> {
        self.factories
            .iter()
            .try_for_each(|(name, factory)| factory.validate(name))
    }

    pub fn get(&self, name: &str) -> Option<&FeatureFactory> {
        self.factories.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FeatureFactory)> {
        self.factories.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn default_params(&self) -> RwResult<BTreeMap<String, Feature>> {
        self.factories
            .iter()
            .map(|(name, f)| Ok((name.clone(), f.default_value()?)))
            .collect()
    }

    pub fn random_params<R: Rng + ?Sized>(&self, rng: &mut R) -> RwResult<BTreeMap<String, Feature>> {
        self.factories
            .iter()
            .map(|(name, f)| Ok((name.clone(), f.random(rng)?)))
            .collect()
    }

    /// Mutate every parameter with its governing factory. A parameter without
    /// a factory violates the experiment invariant.
    pub fn mutate_params<R: Rng + ?Sized>(
        &self,
        params: &BTreeMap<String, Feature>,
        probability: f64,
        amplitude: f64,
        rng: &mut R,
    ) -> RwResult<BTreeMap<String, Feature>> {
        params
            .iter()
            .map(|(name, value)| {
                let factory = self
                    .get(name)
                    .ok_or_else(|| config_error!("no feature factory governs parameter '{name}'"))?;
                Ok((name.clone(), factory.mutate(value, probability, amplitude, rng)?))
            })
            .collect()
    }

    /// Reject parameters without a governing factory.
    pub fn check_params<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> RwResult<()> {
        for name in names {
            if !self.factories.contains_key(name) {
                return Err(RwError::Config(format!(
                    "parameter '{name}' has no governing feature factory"
                )));
            }
        }
        Ok(())
    }
}
