#![forbid(unsafe_code)]

//! In-process entry point for the analysis pipeline: a serial ingestion pass
//! builds the read-only global symbol index, then independent compilation
//! units run the full stage sequence (symbols, types, effects,
//! templates/typestates, verification) on parallel workers. The handoff to
//! the code-generation collaborator is `AnalysisOutcome`: a validated
//! representation per accepted unit plus the ordered diagnostics list.

use oath_ast::Program;
use oath_core::{
    analyze_unit, build_global_index, AnalyzedUnit, DiagnosticEntry, EffectRegistry,
    EngineOptions, Severity, Stage,
};
use oath_verify::{Gate, GeneratorRegistry, VerificationReport};
use rayon::prelude::*;

/// A unit that survived every stage: fully typed declarations, finalized
/// effect sets, expanded template instances, and contracts lowered to guard
/// expressions.
#[derive(Debug)]
pub struct ValidatedUnit {
    pub unit: AnalyzedUnit,
    pub report: VerificationReport,
}

#[derive(Debug)]
pub struct UnitOutcome {
    pub name: String,
    /// Rejected units carry no validated representation, only diagnostics.
    pub validated: Option<ValidatedUnit>,
    pub diagnostics: Vec<DiagnosticEntry>,
}

impl UnitOutcome {
    pub fn accepted(&self) -> bool {
        self.validated.is_some()
    }
}

#[derive(Debug)]
pub struct AnalysisOutcome {
    pub units: Vec<UnitOutcome>,
}

impl AnalysisOutcome {
    pub fn accepted(&self) -> bool {
        self.units.iter().all(UnitOutcome::accepted)
    }

    pub fn diagnostics(&self) -> impl Iterator<Item = &DiagnosticEntry> {
        self.units.iter().flat_map(|u| u.diagnostics.iter())
    }

    pub fn errors(&self) -> impl Iterator<Item = &DiagnosticEntry> {
        self.diagnostics()
            .filter(|d| d.severity == Severity::Error)
    }
}

/// The analysis engine. Configuration is plain data; generators for
/// quantified property domains are supplied by the caller (stock primitives
/// are pre-registered).
pub struct Engine {
    options: EngineOptions,
    effects: EffectRegistry,
    generators: GeneratorRegistry,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            options: EngineOptions::default(),
            effects: EffectRegistry::default(),
            generators: GeneratorRegistry::with_defaults(),
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_effects(mut self, effects: EffectRegistry) -> Self {
        self.effects = effects;
        self
    }

    pub fn with_generators(mut self, generators: GeneratorRegistry) -> Self {
        self.generators = generators;
        self
    }

    pub fn generators_mut(&mut self) -> &mut GeneratorRegistry {
        &mut self.generators
    }

    /// Analyzes a whole program. Unit outcomes preserve input order
    /// regardless of worker scheduling.
    pub fn analyze(&self, program: &Program) -> AnalysisOutcome {
        let global = build_global_index(program);

        let units = program
            .units
            .par_iter()
            .map(|unit| {
                let (mut analyzed, mut sink) =
                    analyze_unit(unit, &global, &self.effects, &self.options);

                let report = if sink.stage_open(Stage::Verification) {
                    Gate::new(
                        &mut analyzed,
                        &global,
                        &self.generators,
                        &self.effects,
                        &self.options,
                    )
                    .run(&mut sink)
                } else {
                    VerificationReport::default()
                };

                let accepted = !sink.has_errors();
                UnitOutcome {
                    name: unit.name.clone(),
                    validated: accepted.then(|| ValidatedUnit {
                        unit: analyzed,
                        report,
                    }),
                    diagnostics: sink.into_entries(),
                }
            })
            .collect();

        AnalysisOutcome { units }
    }
}
