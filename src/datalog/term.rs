//! Core term types: constants, atoms, facts.
//!
//! The fact model is a single tagged union over primitive types. Constants
//! carry an explicit type tag; two constants are the same fact argument iff
//! their canonical values match. Interned names print with a leading `/` and
//! never compare equal to the string of the same spelling.

use serde::de::{self, Deserializer};
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Primitive type tags usable in predicate declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeTag {
    /// Interned symbol, printed with a leading `/`
    Name,
    /// UTF-8 string
    String,
    /// Signed 64-bit integer
    Number,
    /// 64-bit float
    Float,
    /// Boolean
    Bool,
    /// Raw bytes
    Bytes,
    /// Nanoseconds since the Unix epoch
    Time,
    /// Nanoseconds
    Duration,
}

impl TypeTag {
    /// Parse a type tag as written in declarations: `Type<name>` etc.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "name" => Some(Self::Name),
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "float" => Some(Self::Float),
            "bool" => Some(Self::Bool),
            "bytes" => Some(Self::Bytes),
            "time" => Some(Self::Time),
            "duration" => Some(Self::Duration),
            _ => None,
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Name => "name",
            Self::String => "string",
            Self::Number => "number",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Bytes => "bytes",
            Self::Time => "time",
            Self::Duration => "duration",
        };
        write!(f, "{}", s)
    }
}

/// A ground constant.
///
/// Numeric widths collapse at construction: there is a single integer lane
/// and a single float lane, so `int 42` and `int64 42` deduplicate by
/// construction while `42` and `42.0` remain distinct facts.
#[derive(Debug, Clone)]
pub enum Const {
    /// Interned symbol (stored without the leading `/`)
    Name(String),
    /// UTF-8 string
    Str(String),
    /// Integer
    Number(i64),
    /// Float (canonicalized: `-0.0` is stored as `0.0`; NaN is rejected
    /// upstream at Assert)
    Float(f64),
    /// Boolean
    Bool(bool),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Nanoseconds since the Unix epoch
    Time(i64),
    /// Nanoseconds
    Duration(i64),
}

impl Const {
    /// The type tag of this constant.
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Self::Name(_) => TypeTag::Name,
            Self::Str(_) => TypeTag::String,
            Self::Number(_) => TypeTag::Number,
            Self::Float(_) => TypeTag::Float,
            Self::Bool(_) => TypeTag::Bool,
            Self::Bytes(_) => TypeTag::Bytes,
            Self::Time(_) => TypeTag::Time,
            Self::Duration(_) => TypeTag::Duration,
        }
    }

    /// Create a name constant, accepting either `/foo` or `foo`.
    pub fn name(s: impl AsRef<str>) -> Self {
        let s = s.as_ref();
        Self::Name(s.strip_prefix('/').unwrap_or(s).to_string())
    }

    /// Create a string constant.
    pub fn string(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    /// Canonicalize the value: negative-zero floats normalize to zero.
    pub fn canonicalize(self) -> Self {
        match self {
            Self::Float(f) if f == 0.0 => Self::Float(0.0),
            other => other,
        }
    }

    /// Whether the value is a NaN float (unstorable).
    pub fn is_nan(&self) -> bool {
        matches!(self, Self::Float(f) if f.is_nan())
    }

    /// Integer view for arithmetic builtins.
    pub fn as_number(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Float view for arithmetic builtins (numbers widen).
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Number(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// String view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Name view (without the leading `/`).
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Self::Name(n) => Some(n),
            _ => None,
        }
    }

    fn tag_rank(&self) -> u8 {
        match self {
            Self::Name(_) => 0,
            Self::Str(_) => 1,
            Self::Number(_) => 2,
            Self::Float(_) => 3,
            Self::Bool(_) => 4,
            Self::Bytes(_) => 5,
            Self::Time(_) => 6,
            Self::Duration(_) => 7,
        }
    }
}

impl PartialEq for Const {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Name(a), Self::Name(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => {
                let a = if *a == 0.0 { 0.0 } else { *a };
                let b = if *b == 0.0 { 0.0 } else { *b };
                a.to_bits() == b.to_bits()
            }
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Time(a), Self::Time(b)) => a == b,
            (Self::Duration(a), Self::Duration(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Const {}

impl Hash for Const {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tag_rank().hash(state);
        match self {
            Self::Name(s) | Self::Str(s) => s.hash(state),
            Self::Number(n) | Self::Time(n) | Self::Duration(n) => n.hash(state),
            Self::Float(f) => {
                let f = if *f == 0.0 { 0.0 } else { *f };
                f.to_bits().hash(state);
            }
            Self::Bool(b) => b.hash(state),
            Self::Bytes(b) => b.hash(state),
        }
    }
}

impl PartialOrd for Const {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Const {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Name(a), Self::Name(b)) => a.cmp(b),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (Self::Number(a), Self::Number(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            (Self::Time(a), Self::Time(b)) => a.cmp(b),
            (Self::Duration(a), Self::Duration(b)) => a.cmp(b),
            _ => self.tag_rank().cmp(&other.tag_rank()),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(n) => write!(f, "/{}", n),
            Self::Str(s) => write!(f, "{:?}", s),
            Self::Number(n) => write!(f, "{}", n),
            Self::Float(x) => {
                if x.fract() == 0.0 && x.is_finite() {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            Self::Bool(b) => write!(f, "{}", b),
            Self::Bytes(b) => write!(f, "0x{}", hex_encode(b)),
            Self::Time(ns) => write!(f, "@{}", ns),
            Self::Duration(ns) => write!(f, "~{}", ns),
        }
    }
}

// Snapshots require full type fidelity, so constants serialize as a tagged
// `{type, value}` record rather than bare JSON scalars.
impl Serialize for Const {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Const", 2)?;
        s.serialize_field("type", &self.type_tag())?;
        match self {
            Self::Name(v) | Self::Str(v) => s.serialize_field("value", v)?,
            Self::Number(v) | Self::Time(v) | Self::Duration(v) => {
                s.serialize_field("value", v)?
            }
            Self::Float(v) => s.serialize_field("value", v)?,
            Self::Bool(v) => s.serialize_field("value", v)?,
            Self::Bytes(v) => s.serialize_field("value", &hex_encode(v))?,
        }
        s.end()
    }
}

impl<'de> Deserialize<'de> for Const {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Repr {
            #[serde(rename = "type")]
            tag: TypeTag,
            value: serde_json::Value,
        }

        let repr = Repr::deserialize(deserializer)?;
        let wrong = |want: &str| de::Error::custom(format!("expected {} value", want));
        let c = match repr.tag {
            TypeTag::Name => Const::Name(
                repr.value
                    .as_str()
                    .ok_or_else(|| wrong("string"))?
                    .to_string(),
            ),
            TypeTag::String => Const::Str(
                repr.value
                    .as_str()
                    .ok_or_else(|| wrong("string"))?
                    .to_string(),
            ),
            TypeTag::Number => Const::Number(repr.value.as_i64().ok_or_else(|| wrong("i64"))?),
            TypeTag::Float => Const::Float(repr.value.as_f64().ok_or_else(|| wrong("f64"))?),
            TypeTag::Bool => Const::Bool(repr.value.as_bool().ok_or_else(|| wrong("bool"))?),
            TypeTag::Bytes => {
                let hex = repr.value.as_str().ok_or_else(|| wrong("hex string"))?;
                Const::Bytes(hex_decode(hex).ok_or_else(|| wrong("hex string"))?)
            }
            TypeTag::Time => Const::Time(repr.value.as_i64().ok_or_else(|| wrong("i64"))?),
            TypeTag::Duration => {
                Const::Duration(repr.value.as_i64().ok_or_else(|| wrong("i64"))?)
            }
        };
        Ok(c.canonicalize())
    }
}

/// A term in a rule: either a variable or a ground constant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Term {
    /// Rule variable (uppercase identifier)
    Var(String),
    /// Ground constant
    Const(Const),
}

impl Term {
    /// Variable name, if this is a variable.
    pub fn as_var(&self) -> Option<&str> {
        match self {
            Self::Var(v) => Some(v),
            Self::Const(_) => None,
        }
    }

    /// Constant value, if ground.
    pub fn as_const(&self) -> Option<&Const> {
        match self {
            Self::Var(_) => None,
            Self::Const(c) => Some(c),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Var(v) => write!(f, "{}", v),
            Self::Const(c) => write!(f, "{}", c),
        }
    }
}

/// A predicate applied to terms. Ground when every term is a constant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Atom {
    /// Predicate symbol (lowercase)
    pub predicate: String,
    /// Argument terms
    pub args: Vec<Term>,
}

impl Atom {
    /// Create an atom.
    pub fn new(predicate: impl Into<String>, args: Vec<Term>) -> Self {
        Self {
            predicate: predicate.into(),
            args,
        }
    }

    /// Whether every argument is a ground constant.
    pub fn is_ground(&self) -> bool {
        self.args.iter().all(|t| matches!(t, Term::Const(_)))
    }

    /// Convert to a fact. Returns `None` if any argument is a variable.
    pub fn to_fact(&self) -> Option<Fact> {
        let args = self
            .args
            .iter()
            .map(|t| t.as_const().cloned())
            .collect::<Option<Vec<_>>>()?;
        Some(Fact::new(self.predicate.clone(), args))
    }

    /// Variables appearing in this atom, in order of first occurrence.
    pub fn variables(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for t in &self.args {
            if let Term::Var(v) = t {
                if !seen.contains(&v.as_str()) {
                    seen.push(v.as_str());
                }
            }
        }
        seen
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.predicate)?;
        for (i, t) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", t)?;
        }
        write!(f, ")")
    }
}

/// A ground fact: predicate plus canonical constant arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fact {
    /// Predicate symbol
    pub predicate: String,
    /// Ground arguments
    pub args: Vec<Const>,
}

impl Fact {
    /// Create a fact, canonicalizing each argument.
    pub fn new(predicate: impl Into<String>, args: Vec<Const>) -> Self {
        Self {
            predicate: predicate.into(),
            args: args.into_iter().map(Const::canonicalize).collect(),
        }
    }

    /// Convert back to a ground atom. Total for stored facts.
    pub fn to_atom(&self) -> Atom {
        Atom::new(
            self.predicate.clone(),
            self.args.iter().cloned().map(Term::Const).collect(),
        )
    }

    /// Arity of the fact.
    pub fn arity(&self) -> usize {
        self.args.len()
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.predicate)?;
        for (i, c) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", c)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_vs_string_distinct() {
        assert_ne!(Const::name("/foo"), Const::string("/foo"));
        assert_eq!(Const::name("/foo"), Const::name("foo"));
    }

    #[test]
    fn test_float_canonical_zero() {
        assert_eq!(Const::Float(-0.0).canonicalize(), Const::Float(0.0));
        assert_eq!(Const::Float(-0.0), Const::Float(0.0));
    }

    #[test]
    fn test_number_float_distinct() {
        assert_ne!(Const::Number(42), Const::Float(42.0));
    }

    #[test]
    fn test_display() {
        assert_eq!(Const::name("foo").to_string(), "/foo");
        assert_eq!(Const::string("foo").to_string(), "\"foo\"");
        assert_eq!(Const::Float(1.0).to_string(), "1.0");
        let f = Fact::new("edge", vec![Const::name("a"), Const::name("b")]);
        assert_eq!(f.to_string(), "edge(/a, /b)");
    }

    #[test]
    fn test_typed_serde_round_trip() {
        let facts = vec![
            Fact::new("p", vec![Const::name("x"), Const::string("/x")]),
            Fact::new("q", vec![Const::Number(42), Const::Float(42.0)]),
            Fact::new("r", vec![Const::Bytes(vec![0xde, 0xad]), Const::Bool(true)]),
            Fact::new("t", vec![Const::Time(1_700_000_000_000_000_000)]),
        ];
        for fact in facts {
            let json = serde_json::to_string(&fact).unwrap();
            let back: Fact = serde_json::from_str(&json).unwrap();
            assert_eq!(fact, back);
        }
    }

    #[test]
    fn test_serde_preserves_type_tags() {
        let fact = Fact::new("p", vec![Const::name("x")]);
        let json = serde_json::to_value(&fact).unwrap();
        assert_eq!(json["args"][0]["type"], "name");
        assert_eq!(json["args"][0]["value"], "x");
    }

    #[test]
    fn test_atom_fact_round_trip() {
        let fact = Fact::new("p", vec![Const::Number(1)]);
        let atom = fact.to_atom();
        assert!(atom.is_ground());
        assert_eq!(atom.to_fact().unwrap(), fact);
    }

    #[test]
    fn test_atom_variables() {
        let atom = Atom::new(
            "p",
            vec![
                Term::Var("X".into()),
                Term::Const(Const::Number(1)),
                Term::Var("Y".into()),
                Term::Var("X".into()),
            ],
        );
        assert_eq!(atom.variables(), vec!["X", "Y"]);
    }
}
