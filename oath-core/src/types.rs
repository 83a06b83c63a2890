#![forbid(unsafe_code)]

use regex::Regex;

use crate::effects::EffectSet;
use crate::program::DeclId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Prim {
    Int,
    Float,
    Decimal,
    Bool,
    Str,
    Unit,
}

impl Prim {
    pub fn name(&self) -> &'static str {
        match self {
            Prim::Int => "Int",
            Prim::Float => "Float",
            Prim::Decimal => "Decimal",
            Prim::Bool => "Bool",
            Prim::Str => "String",
            Prim::Unit => "Unit",
        }
    }
}

/// A statically known literal value, as used by constraint guards and the
/// verification evaluator. Decimal is exact: mantissa * 10^-scale.
#[derive(Clone, Debug, PartialEq)]
pub enum ConstValue {
    Int(i64),
    Float(f64),
    Decimal { mantissa: i128, scale: u32 },
    Bool(bool),
    Str(String),
}

impl ConstValue {
    pub fn prim(&self) -> Prim {
        match self {
            ConstValue::Int(_) => Prim::Int,
            ConstValue::Float(_) => Prim::Float,
            ConstValue::Decimal { .. } => Prim::Decimal,
            ConstValue::Bool(_) => Prim::Bool,
            ConstValue::Str(_) => Prim::Str,
        }
    }

    pub fn display(&self) -> String {
        match self {
            ConstValue::Int(n) => n.to_string(),
            ConstValue::Float(x) => x.to_string(),
            ConstValue::Decimal { mantissa, scale } => format_decimal(*mantissa, *scale),
            ConstValue::Bool(b) => b.to_string(),
            ConstValue::Str(s) => format!("\"{s}\""),
        }
    }
}

pub fn format_decimal(mantissa: i128, scale: u32) -> String {
    if scale == 0 {
        return mantissa.to_string();
    }
    let sign = if mantissa < 0 { "-" } else { "" };
    let digits = mantissa.unsigned_abs().to_string();
    if digits.len() <= scale as usize {
        let zeros = "0".repeat(scale as usize - digits.len());
        format!("{sign}0.{zeros}{digits}")
    } else {
        let split = digits.len() - scale as usize;
        format!("{sign}{}.{}", &digits[..split], &digits[split..])
    }
}

/// Compare two exact decimals by rescaling to the larger scale.
pub fn decimal_cmp(a_m: i128, a_s: u32, b_m: i128, b_s: u32) -> std::cmp::Ordering {
    let scale = a_s.max(b_s);
    let a = a_m * 10i128.pow(scale - a_s);
    let b = b_m * 10i128.pow(scale - b_s);
    a.cmp(&b)
}

/// Refinement predicate of a constrained primitive. Stored as an executable
/// guard, not just metadata: the resolver evaluates it against statically
/// known literals and the verifier reuses it for runtime guard lowering.
#[derive(Clone, Debug)]
pub enum Predicate {
    /// Inclusive numeric range.
    Range { lo: i64, hi: i64 },
    /// Full-match regex over the string domain.
    Pattern { source: String, regex: Regex },
    /// Explicit enumerated value set.
    OneOf { values: Vec<ConstValue> },
}

impl Predicate {
    pub fn pattern(source: &str) -> Result<Predicate, regex::Error> {
        // Anchor so the guard is a full-match test, not a search.
        let regex = Regex::new(&format!("^(?:{source})$"))?;
        Ok(Predicate::Pattern {
            source: source.to_string(),
            regex,
        })
    }

    /// Does a statically known value satisfy the guard? `None` when the value
    /// kind is outside the predicate's domain (a type error, not a guard
    /// failure).
    pub fn admits(&self, value: &ConstValue) -> Option<bool> {
        match (self, value) {
            (Predicate::Range { lo, hi }, ConstValue::Int(n)) => Some(*n >= *lo && *n <= *hi),
            (Predicate::Range { lo, hi }, ConstValue::Float(x)) => {
                Some(*x >= *lo as f64 && *x <= *hi as f64)
            }
            (Predicate::Range { lo, hi }, ConstValue::Decimal { mantissa, scale }) => {
                let ge = decimal_cmp(*mantissa, *scale, *lo as i128, 0).is_ge();
                let le = decimal_cmp(*mantissa, *scale, *hi as i128, 0).is_le();
                Some(ge && le)
            }
            (Predicate::Pattern { regex, .. }, ConstValue::Str(s)) => Some(regex.is_match(s)),
            (Predicate::OneOf { values }, v) => Some(values.iter().any(|c| c == v)),
            _ => None,
        }
    }

    pub fn display(&self) -> String {
        match self {
            Predicate::Range { lo, hi } => format!("{lo}..{hi}"),
            Predicate::Pattern { source, .. } => format!("/{source}/"),
            Predicate::OneOf { values } => values
                .iter()
                .map(|v| v.display())
                .collect::<Vec<_>>()
                .join(" | "),
        }
    }
}

impl PartialEq for Predicate {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Predicate::Range { lo: a, hi: b }, Predicate::Range { lo: c, hi: d }) => {
                a == c && b == d
            }
            (Predicate::Pattern { source: a, .. }, Predicate::Pattern { source: b, .. }) => a == b,
            (Predicate::OneOf { values: a }, Predicate::OneOf { values: b }) => a == b,
            _ => false,
        }
    }
}

/// Dependent-array length: literal constant or a symbolic name that degraded
/// to a runtime-checked obligation.
#[derive(Clone, Debug, PartialEq)]
pub enum LenExpr {
    Const(i64),
    Sym(String),
}

impl LenExpr {
    pub fn display(&self) -> String {
        match self {
            LenExpr::Const(n) => n.to_string(),
            LenExpr::Sym(s) => s.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub name: String,
    pub ty: Type,
    pub optional: bool,
}

#[derive(Clone, Debug)]
pub enum Type {
    /// Optimistic placeholder while a mutually recursive declaration is in
    /// progress. Never escapes a successful resolution.
    Pending,
    /// Poisoned by an earlier diagnostic; suppresses cascading errors.
    Error,
    Prim(Prim),
    Constrained {
        base: Box<Type>,
        pred: Predicate,
    },
    Array(Box<Type>),
    DependentArray {
        elem: Box<Type>,
        len: LenExpr,
    },
    Map {
        key: Box<Type>,
        value: Box<Type>,
    },
    Tuple(Vec<Type>),
    /// Ordered field list; order preserved for display, ignored by equality.
    Record(Vec<Field>),
    /// Alternatives in declaration order; first-match checking makes the
    /// order observable, equality treats it as a set.
    Union(Vec<Type>),
    Intersection(Vec<Type>),
    /// Unsubstituted generic parameter.
    Param {
        name: String,
        bound: Option<Box<Type>>,
    },
    /// Nominal type declaration (one with members), possibly instantiated.
    Nominal {
        decl: DeclId,
        name: String,
        args: Vec<Type>,
    },
    /// One state of a typestate interface, tracked on the binding.
    State {
        interface: DeclId,
        interface_name: String,
        state: String,
    },
    Function {
        params: Vec<Type>,
        ret: Box<Type>,
        effects: EffectSet,
    },
}

impl Type {
    pub fn int() -> Type {
        Type::Prim(Prim::Int)
    }

    pub fn bool() -> Type {
        Type::Prim(Prim::Bool)
    }

    pub fn string() -> Type {
        Type::Prim(Prim::Str)
    }

    pub fn unit() -> Type {
        Type::Prim(Prim::Unit)
    }

    pub fn base(&self) -> &Type {
        match self {
            Type::Constrained { base, .. } => base.base(),
            other => other,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Type::Pending)
    }

    /// No `Pending` anywhere inside. `Error` counts as resolved; it will
    /// never converge to anything else.
    pub fn is_resolved(&self) -> bool {
        match self {
            Type::Pending => false,
            Type::Error | Type::Prim(_) | Type::Param { bound: None, .. } => true,
            Type::Param { bound: Some(b), .. } => b.is_resolved(),
            Type::Constrained { base, .. } => base.is_resolved(),
            Type::Array(elem) => elem.is_resolved(),
            Type::DependentArray { elem, .. } => elem.is_resolved(),
            Type::Map { key, value } => key.is_resolved() && value.is_resolved(),
            Type::Tuple(items) => items.iter().all(Type::is_resolved),
            Type::Record(fields) => fields.iter().all(|f| f.ty.is_resolved()),
            Type::Union(alts) => alts.iter().all(Type::is_resolved),
            Type::Intersection(parts) => parts.iter().all(Type::is_resolved),
            Type::Nominal { args, .. } => args.iter().all(Type::is_resolved),
            Type::State { .. } => true,
            Type::Function { params, ret, .. } => {
                params.iter().all(Type::is_resolved) && ret.is_resolved()
            }
        }
    }

    pub fn display(&self) -> String {
        match self {
            Type::Pending => "<pending>".to_string(),
            Type::Error => "<error>".to_string(),
            Type::Prim(p) => p.name().to_string(),
            Type::Constrained { base, pred } => {
                format!("{}[{}]", base.display(), pred.display())
            }
            Type::Array(elem) => format!("Array<{}>", elem.display()),
            Type::DependentArray { elem, len } => {
                format!("Array<{}, {}>", elem.display(), len.display())
            }
            Type::Map { key, value } => {
                format!("Map<{}, {}>", key.display(), value.display())
            }
            Type::Tuple(items) => {
                let inner = items
                    .iter()
                    .map(|t| t.display())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("({inner})")
            }
            Type::Record(fields) => {
                let inner = fields
                    .iter()
                    .map(|f| {
                        let opt = if f.optional { "?" } else { "" };
                        format!("{}{}: {}", f.name, opt, f.ty.display())
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{{{inner}}}")
            }
            Type::Union(alts) => alts
                .iter()
                .map(|t| t.display())
                .collect::<Vec<_>>()
                .join(" | "),
            Type::Intersection(parts) => parts
                .iter()
                .map(|t| t.display())
                .collect::<Vec<_>>()
                .join(" & "),
            Type::Param { name, .. } => name.clone(),
            Type::Nominal { name, args, .. } => {
                if args.is_empty() {
                    name.clone()
                } else {
                    let inner = args
                        .iter()
                        .map(|t| t.display())
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("{name}<{inner}>")
                }
            }
            Type::State {
                interface_name,
                state,
                ..
            } => format!("{interface_name}.{state}"),
            Type::Function {
                params,
                ret,
                effects,
            } => {
                let ps = params
                    .iter()
                    .map(|t| t.display())
                    .collect::<Vec<_>>()
                    .join(", ");
                if effects.is_empty() {
                    format!("fn({ps}) -> {}", ret.display())
                } else {
                    format!("fn({ps}) -> {} with {}", ret.display(), effects.display())
                }
            }
        }
    }
}

fn fields_equal(a: &[Field], b: &[Field]) -> bool {
    // Field *sets* are compared; declaration order is display-only.
    a.len() == b.len()
        && a.iter().all(|fa| {
            b.iter()
                .any(|fb| fa.name == fb.name && fa.optional == fb.optional && fa.ty == fb.ty)
        })
}

fn set_equal(a: &[Type], b: &[Type]) -> bool {
    a.len() == b.len()
        && a.iter().all(|ta| b.iter().any(|tb| ta == tb))
        && b.iter().all(|tb| a.iter().any(|ta| ta == tb))
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Type::Pending, Type::Pending) | (Type::Error, Type::Error) => true,
            (Type::Prim(a), Type::Prim(b)) => a == b,
            (
                Type::Constrained { base: ab, pred: ap },
                Type::Constrained { base: bb, pred: bp },
            ) => ab == bb && ap == bp,
            (Type::Array(a), Type::Array(b)) => a == b,
            (
                Type::DependentArray { elem: ae, len: al },
                Type::DependentArray { elem: be, len: bl },
            ) => ae == be && al == bl,
            (
                Type::Map { key: ak, value: av },
                Type::Map { key: bk, value: bv },
            ) => ak == bk && av == bv,
            (Type::Tuple(a), Type::Tuple(b)) => a == b,
            (Type::Record(a), Type::Record(b)) => fields_equal(a, b),
            (Type::Union(a), Type::Union(b)) => set_equal(a, b),
            (Type::Intersection(a), Type::Intersection(b)) => set_equal(a, b),
            (
                Type::Param { name: an, bound: ab },
                Type::Param { name: bn, bound: bb },
            ) => an == bn && ab == bb,
            (
                Type::Nominal { decl: ad, args: aa, .. },
                Type::Nominal { decl: bd, args: ba, .. },
            ) => ad == bd && aa == ba,
            (
                Type::State {
                    interface: ai,
                    state: asn,
                    ..
                },
                Type::State {
                    interface: bi,
                    state: bsn,
                    ..
                },
            ) => ai == bi && asn == bsn,
            (
                Type::Function {
                    params: ap,
                    ret: ar,
                    effects: ae,
                },
                Type::Function {
                    params: bp,
                    ret: br,
                    effects: be,
                },
            ) => ap == bp && ar == br && ae == be,
            _ => false,
        }
    }
}
