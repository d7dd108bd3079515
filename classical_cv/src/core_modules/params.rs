// THEORY:
// Parameters are the only knob a caller has on an algorithm. Each algorithm declares
// an ordered schema of `ParamSpec`s (name, type, default, legal range); callers supply
// a sparse `ParameterSet`. Before an operation runs, the caller's set is merged over
// the schema: every declared name ends up with exactly one well-typed value, explicit
// values win over defaults, and anything undeclared or out of range is rejected up
// front instead of reaching the Image Library.
//
// Choice parameters are documented, not enforced: an unrecognized choice is passed
// through so the operation can take its documented default branch (for example a
// Haar cascade type it doesn't know returns the input unchanged).

use crate::core_modules::library::LibraryError;
use crate::error::DispatchError;
use std::fmt;

/// A single parameter value.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(untagged))]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    /// A (width, height) pair such as a kernel or template size.
    Size(u32, u32),
    Choice(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(value) => write!(f, "{value}"),
            ParamValue::Float(value) => write!(f, "{value}"),
            ParamValue::Size(width, height) => write!(f, "{width}x{height}"),
            ParamValue::Choice(value) => f.write_str(value),
        }
    }
}

/// Type, default and legal range of a parameter.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize), serde(tag = "type", rename_all = "lowercase"))]
pub enum ParamKind {
    Int { default: i64, min: i64, max: i64 },
    Float { default: f64, min: f64, max: f64 },
    /// Both components share the same inclusive range.
    Size { default: (u32, u32), min: u32, max: u32 },
    Choice { default: &'static str, options: &'static [&'static str] },
}

/// One entry of an algorithm's parameter schema.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub doc: &'static str,
}

impl ParamSpec {
    pub const fn int(name: &'static str, default: i64, min: i64, max: i64, doc: &'static str) -> Self {
        Self { name, kind: ParamKind::Int { default, min, max }, doc }
    }

    pub const fn float(name: &'static str, default: f64, min: f64, max: f64, doc: &'static str) -> Self {
        Self { name, kind: ParamKind::Float { default, min, max }, doc }
    }

    pub const fn size(name: &'static str, default: (u32, u32), min: u32, max: u32, doc: &'static str) -> Self {
        Self { name, kind: ParamKind::Size { default, min, max }, doc }
    }

    pub const fn choice(
        name: &'static str,
        default: &'static str,
        options: &'static [&'static str],
        doc: &'static str,
    ) -> Self {
        Self { name, kind: ParamKind::Choice { default, options }, doc }
    }

    pub fn default_value(&self) -> ParamValue {
        match &self.kind {
            ParamKind::Int { default, .. } => ParamValue::Int(*default),
            ParamKind::Float { default, .. } => ParamValue::Float(*default),
            ParamKind::Size { default, .. } => ParamValue::Size(default.0, default.1),
            ParamKind::Choice { default, .. } => ParamValue::Choice((*default).to_string()),
        }
    }

    /// Type-checks and range-checks a value, coercing compatible numeric forms.
    pub fn check(&self, value: &ParamValue) -> Result<ParamValue, String> {
        match (&self.kind, value) {
            (ParamKind::Int { min, max, .. }, ParamValue::Int(v)) => self.in_range(*v, *min, *max).map(ParamValue::Int),
            (ParamKind::Int { min, max, .. }, ParamValue::Float(v)) if v.fract() == 0.0 => {
                self.in_range(*v as i64, *min, *max).map(ParamValue::Int)
            }
            (ParamKind::Float { .. }, ParamValue::Float(v)) if !v.is_finite() => {
                Err(format!("`{}` must be a finite number, got {v}", self.name))
            }
            (ParamKind::Float { min, max, .. }, ParamValue::Float(v)) => self.in_range(*v, *min, *max).map(ParamValue::Float),
            (ParamKind::Float { min, max, .. }, ParamValue::Int(v)) => {
                self.in_range(*v as f64, *min, *max).map(ParamValue::Float)
            }
            (ParamKind::Size { min, max, .. }, ParamValue::Size(width, height)) => {
                self.in_range(*width, *min, *max)?;
                self.in_range(*height, *min, *max)?;
                Ok(ParamValue::Size(*width, *height))
            }
            (ParamKind::Size { min, max, .. }, ParamValue::Int(v)) => {
                let side = u32::try_from(*v).map_err(|_| format!("`{}` must be non-negative, got {v}", self.name))?;
                self.in_range(side, *min, *max)?;
                Ok(ParamValue::Size(side, side))
            }
            (ParamKind::Choice { .. }, ParamValue::Choice(v)) => Ok(ParamValue::Choice(v.clone())),
            (kind, other) => Err(format!("`{}` expects {}, got `{other}`", self.name, kind.type_name())),
        }
    }

    /// Parses the textual form used by the shells (`5`, `1.5`, `5x5`, `otsu`).
    pub fn parse(&self, text: &str) -> Result<ParamValue, String> {
        let text = text.trim();
        let parsed = match &self.kind {
            ParamKind::Int { .. } => text
                .parse::<i64>()
                .map(ParamValue::Int)
                .map_err(|_| format!("`{}` expects an integer, got `{text}`", self.name))?,
            ParamKind::Float { .. } => text
                .parse::<f64>()
                .map(ParamValue::Float)
                .map_err(|_| format!("`{}` expects a number, got `{text}`", self.name))?,
            ParamKind::Size { .. } => parse_size(text).ok_or_else(|| {
                format!("`{}` expects a size like `5x5`, got `{text}`", self.name)
            })?,
            ParamKind::Choice { .. } => ParamValue::Choice(text.to_string()),
        };
        self.check(&parsed)
    }

    fn in_range<T: PartialOrd + fmt::Display + Copy>(&self, value: T, min: T, max: T) -> Result<T, String> {
        if value < min || value > max {
            Err(format!("`{}` must be within [{min}, {max}], got {value}", self.name))
        } else {
            Ok(value)
        }
    }
}

impl ParamKind {
    fn type_name(&self) -> &'static str {
        match self {
            ParamKind::Int { .. } => "an integer",
            ParamKind::Float { .. } => "a number",
            ParamKind::Size { .. } => "a size",
            ParamKind::Choice { .. } => "a choice",
        }
    }
}

fn parse_size(text: &str) -> Option<ParamValue> {
    let mut parts = text.split(['x', 'X', ',']).map(str::trim);
    let width = parts.next()?.parse::<u32>().ok()?;
    let height = match parts.next() {
        Some(part) => part.parse::<u32>().ok()?,
        None => width,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(ParamValue::Size(width, height))
}

/// An ordered name → value mapping supplied by a caller.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ParameterSet {
    entries: Vec<(String, ParamValue)>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of `insert`.
    pub fn with(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.insert(name, value);
        self
    }

    /// Sets a value, replacing any earlier value for the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) {
        let name = name.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.entries.iter().find(|(existing, _)| existing == name).map(|(_, value)| value)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Parses `name=value` pairs against a schema.
    pub fn parse<'a>(pairs: impl IntoIterator<Item = &'a str>, schema: &[ParamSpec]) -> Result<Self, DispatchError> {
        let mut set = Self::new();
        for pair in pairs {
            let (name, text) = pair
                .split_once('=')
                .ok_or_else(|| DispatchError::InvalidParameter(format!("expected `name=value`, got `{pair}`")))?;
            let spec = find_spec(schema, name.trim())?;
            let value = spec.parse(text).map_err(DispatchError::InvalidParameter)?;
            set.insert(spec.name, value);
        }
        Ok(set)
    }

    /// Resolves every schema entry: explicit values (checked) override defaults.
    pub fn merged_with(&self, schema: &[ParamSpec]) -> Result<Self, DispatchError> {
        for (name, _) in &self.entries {
            find_spec(schema, name)?;
        }
        let mut merged = Self::new();
        for spec in schema {
            let value = match self.get(spec.name) {
                Some(value) => spec.check(value).map_err(DispatchError::InvalidParameter)?,
                None => spec.default_value(),
            };
            merged.entries.push((spec.name.to_string(), value));
        }
        Ok(merged)
    }

    /// Carries values over to another schema, dropping names it doesn't declare and
    /// values it doesn't accept, then merges with its defaults.
    pub fn projected_onto(&self, schema: &[ParamSpec]) -> Self {
        let mut projected = Self::new();
        for spec in schema {
            let value = self
                .get(spec.name)
                .and_then(|value| spec.check(value).ok())
                .unwrap_or_else(|| spec.default_value());
            projected.entries.push((spec.name.to_string(), value));
        }
        projected
    }

    pub fn int(&self, name: &str) -> Result<i64, LibraryError> {
        match self.require(name)? {
            ParamValue::Int(value) => Ok(*value),
            ParamValue::Float(value) if value.fract() == 0.0 => Ok(*value as i64),
            other => Err(mistyped(name, other)),
        }
    }

    pub fn float(&self, name: &str) -> Result<f64, LibraryError> {
        match self.require(name)? {
            ParamValue::Float(value) => Ok(*value),
            ParamValue::Int(value) => Ok(*value as f64),
            other => Err(mistyped(name, other)),
        }
    }

    pub fn size(&self, name: &str) -> Result<(u32, u32), LibraryError> {
        match self.require(name)? {
            ParamValue::Size(width, height) => Ok((*width, *height)),
            ParamValue::Int(side) if *side >= 0 => Ok((*side as u32, *side as u32)),
            other => Err(mistyped(name, other)),
        }
    }

    pub fn choice(&self, name: &str) -> Result<&str, LibraryError> {
        match self.require(name)? {
            ParamValue::Choice(value) => Ok(value),
            other => Err(mistyped(name, other)),
        }
    }

    fn require(&self, name: &str) -> Result<&ParamValue, LibraryError> {
        self.get(name)
            .ok_or_else(|| LibraryError::InvalidParameter(format!("missing parameter `{name}`")))
    }
}

impl fmt::Display for ParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (name, value)) in self.entries.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}

fn find_spec<'s>(schema: &'s [ParamSpec], name: &str) -> Result<&'s ParamSpec, DispatchError> {
    schema
        .iter()
        .find(|spec| spec.name == name)
        .ok_or_else(|| DispatchError::InvalidParameter(format!("unknown parameter `{name}`")))
}

fn mistyped(name: &str, value: &ParamValue) -> LibraryError {
    LibraryError::InvalidParameter(format!("parameter `{name}` has unexpected value `{value}`"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &[ParamSpec] = &[
        ParamSpec::size("kernelSize", (5, 5), 1, 31, "kernel"),
        ParamSpec::float("sigma", 1.0, 0.0, 50.0, "sigma"),
        ParamSpec::int("iterations", 2, 1, 10, "count"),
        ParamSpec::choice("mode", "otsu", &["otsu", "binary"], "mode"),
    ];

    #[test]
    fn empty_set_merges_to_defaults() {
        let merged = ParameterSet::new().merged_with(SCHEMA).unwrap();
        assert_eq!(merged.len(), 4);
        assert_eq!(merged.size("kernelSize").unwrap(), (5, 5));
        assert_eq!(merged.float("sigma").unwrap(), 1.0);
        assert_eq!(merged.int("iterations").unwrap(), 2);
        assert_eq!(merged.choice("mode").unwrap(), "otsu");
    }

    #[test]
    fn explicit_values_override_defaults() {
        let set = ParameterSet::new()
            .with("sigma", ParamValue::Int(3))
            .with("kernelSize", ParamValue::Int(7));
        let merged = set.merged_with(SCHEMA).unwrap();
        assert_eq!(merged.float("sigma").unwrap(), 3.0);
        assert_eq!(merged.size("kernelSize").unwrap(), (7, 7));
        assert_eq!(merged.int("iterations").unwrap(), 2);
    }

    #[test]
    fn unknown_names_are_rejected() {
        let set = ParameterSet::new().with("radius", ParamValue::Int(3));
        let error = set.merged_with(SCHEMA).unwrap_err();
        assert!(matches!(error, DispatchError::InvalidParameter(message) if message.contains("radius")));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let set = ParameterSet::new().with("iterations", ParamValue::Int(0));
        assert!(matches!(set.merged_with(SCHEMA), Err(DispatchError::InvalidParameter(_))));
        let set = ParameterSet::new().with("kernelSize", ParamValue::Size(5, 99));
        assert!(matches!(set.merged_with(SCHEMA), Err(DispatchError::InvalidParameter(_))));
    }

    #[test]
    fn non_finite_numbers_are_rejected() {
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let set = ParameterSet::new().with("sigma", ParamValue::Float(value));
            assert!(matches!(set.merged_with(SCHEMA), Err(DispatchError::InvalidParameter(_))), "{value}");
            let set = ParameterSet::new().with("iterations", ParamValue::Float(value));
            assert!(matches!(set.merged_with(SCHEMA), Err(DispatchError::InvalidParameter(_))), "{value}");
        }
        assert!(ParameterSet::parse(["sigma=NaN"], SCHEMA).is_err());
        assert!(ParameterSet::parse(["sigma=inf"], SCHEMA).is_err());
    }

    #[test]
    fn mistyped_values_are_rejected() {
        let set = ParameterSet::new().with("sigma", ParamValue::Choice("wide".into()));
        assert!(matches!(set.merged_with(SCHEMA), Err(DispatchError::InvalidParameter(_))));
        let set = ParameterSet::new().with("iterations", ParamValue::Float(1.5));
        assert!(matches!(set.merged_with(SCHEMA), Err(DispatchError::InvalidParameter(_))));
    }

    #[test]
    fn unknown_choices_pass_through() {
        let set = ParameterSet::new().with("mode", ParamValue::Choice("triangle".into()));
        assert_eq!(set.merged_with(SCHEMA).unwrap().choice("mode").unwrap(), "triangle");
    }

    #[test]
    fn parses_textual_pairs() {
        let set = ParameterSet::parse(["sigma=2.5", "kernelSize=3x7", "mode = binary"], SCHEMA).unwrap();
        assert_eq!(set.get("sigma"), Some(&ParamValue::Float(2.5)));
        assert_eq!(set.get("kernelSize"), Some(&ParamValue::Size(3, 7)));
        assert_eq!(set.get("mode"), Some(&ParamValue::Choice("binary".into())));
        assert!(ParameterSet::parse(["sigma"], SCHEMA).is_err());
        assert!(ParameterSet::parse(["iterations=two"], SCHEMA).is_err());
        assert!(ParameterSet::parse(["kernelSize=3x4x5"], SCHEMA).is_err());
    }

    #[test]
    fn later_inserts_replace_earlier_ones() {
        let set = ParameterSet::new()
            .with("sigma", ParamValue::Float(1.0))
            .with("sigma", ParamValue::Float(2.0));
        assert_eq!(set.len(), 1);
        assert_eq!(set.to_string(), "sigma=2");
    }

    #[test]
    fn projection_keeps_shared_names_only() {
        const OTHER: &[ParamSpec] = &[
            ParamSpec::float("sigma", 0.5, 0.0, 2.0, "sigma"),
            ParamSpec::int("levels", 4, 1, 8, "levels"),
        ];
        let set = ParameterSet::new()
            .with("sigma", ParamValue::Float(1.5))
            .with("iterations", ParamValue::Int(3));
        let projected = set.projected_onto(OTHER);
        assert_eq!(projected.float("sigma").unwrap(), 1.5);
        assert_eq!(projected.int("levels").unwrap(), 4);
        assert!(projected.get("iterations").is_none());

        let too_large = ParameterSet::new().with("sigma", ParamValue::Float(9.0));
        assert_eq!(too_large.projected_onto(OTHER).float("sigma").unwrap(), 0.5);
    }
}
