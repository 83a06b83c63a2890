#![forbid(unsafe_code)]

mod eval;
mod gate;
mod generators;
mod obligation;

pub use eval::{eval, Env};
pub use gate::{Gate, VerificationReport};
pub use generators::{
    BoolGenerator, FixedGenerator, GeneratorRegistry, IntGenerator, IntRangeGenerator,
    SampleGenerator, StringGenerator,
};
pub use obligation::{
    GuardCheck, GuardSite, LoweredGuard, Obligation, ObligationKind, ObligationStatus,
};
