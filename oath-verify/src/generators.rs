#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use oath_core::ConstValue;

/// External capability producing a finite, bounded sample sequence for one
/// quantified domain. Implementations should yield samples in increasing
/// magnitude so the first failing sample reported is also the minimal one.
pub trait SampleGenerator: Send + Sync {
    fn samples(&self, limit: usize) -> Vec<ConstValue>;
}

/// Registry of sample generators, keyed by the display form of the resolved
/// domain type (`Int`, `String`, `Int[1..100]`, ...). A `forAll` over a
/// domain with no registered generator fails compilation with
/// `NoGeneratorForDomain`.
#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    generators: HashMap<String, Arc<dyn SampleGenerator>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stock generators for the unconstrained primitive domains.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register("Int", IntGenerator);
        reg.register("Bool", BoolGenerator);
        reg.register("String", StringGenerator);
        reg
    }

    pub fn register(&mut self, domain: impl Into<String>, generator: impl SampleGenerator + 'static) {
        self.generators.insert(domain.into(), Arc::new(generator));
    }

    pub fn get(&self, domain: &str) -> Option<&Arc<dyn SampleGenerator>> {
        self.generators.get(domain)
    }
}

/// Integers in increasing magnitude, extremes last.
pub struct IntGenerator;

impl SampleGenerator for IntGenerator {
    fn samples(&self, limit: usize) -> Vec<ConstValue> {
        let mut out = vec![ConstValue::Int(0)];
        let mut n: i64 = 1;
        while out.len() + 2 < limit.saturating_sub(2) {
            out.push(ConstValue::Int(n));
            out.push(ConstValue::Int(-n));
            n = match n.checked_mul(3) {
                Some(next) => next,
                None => break,
            };
        }
        out.push(ConstValue::Int(i64::MAX));
        out.push(ConstValue::Int(i64::MIN));
        out.truncate(limit);
        out
    }
}

/// Integers from an inclusive range, smallest first.
pub struct IntRangeGenerator {
    pub lo: i64,
    pub hi: i64,
}

impl SampleGenerator for IntRangeGenerator {
    fn samples(&self, limit: usize) -> Vec<ConstValue> {
        if limit == 0 || self.lo > self.hi {
            return Vec::new();
        }
        if limit == 1 {
            return vec![ConstValue::Int(self.lo)];
        }
        let span = (self.hi as i128 - self.lo as i128) as u128;
        let mut out = Vec::new();
        if span < limit as u128 {
            for n in self.lo..=self.hi {
                out.push(ConstValue::Int(n));
            }
        } else {
            // Evenly spaced, both endpoints always included.
            let step = ((span / (limit as u128 - 1)) as i64).max(1);
            let mut n = self.lo;
            for _ in 0..limit - 1 {
                out.push(ConstValue::Int(n));
                n = n.saturating_add(step);
            }
            out.push(ConstValue::Int(self.hi));
        }
        out
    }
}

pub struct BoolGenerator;

impl SampleGenerator for BoolGenerator {
    fn samples(&self, limit: usize) -> Vec<ConstValue> {
        let mut out = vec![ConstValue::Bool(false), ConstValue::Bool(true)];
        out.truncate(limit);
        out
    }
}

/// Strings of increasing length, starting from empty; covers the usual
/// boundary suspects before padding out.
pub struct StringGenerator;

impl SampleGenerator for StringGenerator {
    fn samples(&self, limit: usize) -> Vec<ConstValue> {
        let mut out: Vec<ConstValue> = ["", "a", " ", "0", "ab", "hello", "line\nbreak"]
            .iter()
            .map(|s| ConstValue::Str((*s).to_string()))
            .collect();
        let mut len = 8usize;
        while out.len() < limit.min(32) {
            out.push(ConstValue::Str("x".repeat(len)));
            len *= 2;
        }
        out.truncate(limit);
        out
    }
}

/// A fixed, caller-supplied sequence; handy for tests and for domains with a
/// known enumeration.
pub struct FixedGenerator {
    pub values: Vec<ConstValue>,
}

impl SampleGenerator for FixedGenerator {
    fn samples(&self, limit: usize) -> Vec<ConstValue> {
        self.values.iter().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_samples_grow_in_magnitude() {
        let samples = IntGenerator.samples(16);
        assert_eq!(samples[0], ConstValue::Int(0));
        assert!(samples.contains(&ConstValue::Int(1)));
        assert!(samples.contains(&ConstValue::Int(-1)));
        assert!(samples.len() <= 16);
    }

    #[test]
    fn range_generator_hits_both_ends() {
        let g = IntRangeGenerator { lo: 0, hi: 100 };
        let samples = g.samples(10);
        assert_eq!(samples.first(), Some(&ConstValue::Int(0)));
        assert_eq!(samples.last(), Some(&ConstValue::Int(100)));
    }

    #[test]
    fn registry_lookup_by_domain() {
        let reg = GeneratorRegistry::with_defaults();
        assert!(reg.get("Int").is_some());
        assert!(reg.get("Connection").is_none());
    }
}
