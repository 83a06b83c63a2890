#![forbid(unsafe_code)]

use std::collections::HashMap;

use oath_ast::{DeclKind, Span};

use crate::error::{ErrorKind, SemanticError};
use crate::program::{DeclId, Metadata, VerifyClause};
use crate::resolve::{declared_effect_set, Resolver};
use crate::symbols::SymbolRef;
use crate::types::Type;

/// Who supplies an interface operation of an expanded instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provided {
    Target,
    TemplateDefault,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExpandedOp {
    pub name: String,
    pub ty: Type,
    pub provided_by: Provided,
    pub span: Span,
}

/// A template bound to a target with concrete arguments, fully expanded:
/// every required operation accounted for, template assertions carried along
/// for the verification gate.
#[derive(Clone, Debug)]
pub struct ExpandedInstance {
    pub instance: DeclId,
    pub template: DeclId,
    pub target: DeclId,
    pub args: Vec<Type>,
    pub ops: Vec<ExpandedOp>,
    pub verifies: Vec<VerifyClause>,
}

/// Resolves every `Instance` declaration of the unit. Each instance expands
/// independently; cross-instance default collisions on the same target are
/// detected afterwards. Expansion is a pure function of its inputs, so
/// re-instantiating the same binding yields structurally identical
/// obligations.
pub fn resolve_instances(
    resolver: &mut Resolver<'_>,
) -> (Vec<ExpandedInstance>, Vec<SemanticError>) {
    let mut expanded = Vec::new();
    let mut errors = Vec::new();

    for id in resolver.table.ids() {
        let entry = resolver.table.get(id);
        let DeclKind::Instance(inst) = &entry.ast.kind else {
            continue;
        };
        let inst = inst.clone();
        let scope = entry.scope;
        let span = entry.span;

        match expand_instance(resolver, id, &inst, scope, span) {
            Ok(instance) => expanded.push(instance),
            Err(e) => errors.push(e),
        }
    }

    detect_default_conflicts(resolver, &expanded, &mut errors);
    (expanded, errors)
}

fn expand_instance(
    resolver: &mut Resolver<'_>,
    id: DeclId,
    inst: &oath_ast::InstanceDecl,
    scope: crate::symbols::ScopeId,
    span: Span,
) -> Result<ExpandedInstance, SemanticError> {
    let template_id = resolve_local(resolver, &inst.template, scope)?;
    let target_id = resolve_local(resolver, &inst.target, scope)?;

    let template_entry = resolver.table.get(template_id);
    let template_name = template_entry.name.clone();
    let template_scope = template_entry.scope;
    let template_meta = template_entry.meta.clone();
    let DeclKind::Template(template) = template_entry.ast.kind.clone() else {
        return Err(SemanticError::new(
            ErrorKind::SignatureMismatch,
            format!("'{}' is not a pattern template", inst.template.node),
            inst.template.span,
        ));
    };

    let target_entry = resolver.table.get(target_id);
    let target_name = target_entry.name.clone();
    let DeclKind::Type(_) = target_entry.ast.kind else {
        return Err(SemanticError::new(
            ErrorKind::SignatureMismatch,
            format!(
                "instance target '{}' is not a type declaration",
                inst.target.node
            ),
            inst.target.span,
        ));
    };

    if template.type_params.len() != inst.args.len() {
        return Err(SemanticError::new(
            ErrorKind::SignatureMismatch,
            format!(
                "template '{template_name}' expects {} type argument(s), got {}",
                template.type_params.len(),
                inst.args.len()
            ),
            span,
        ));
    }

    let mut args = Vec::with_capacity(inst.args.len());
    for a in &inst.args {
        args.push(resolver.resolve_type_expr(a, scope)?);
    }

    // Recheck template bounds against the concrete arguments.
    let mut subst: HashMap<String, Type> = HashMap::new();
    for (p, arg) in template.type_params.iter().zip(args.iter()) {
        if let Some(bound_expr) = &p.bound {
            let bound = resolver.resolve_type_expr(bound_expr, template_scope)?;
            if let Err(missing) = resolver.satisfies_interface(arg, &bound) {
                return Err(SemanticError::new(
                    ErrorKind::ConstraintViolation,
                    format!(
                        "type argument {} for parameter '{}' of template '{template_name}' does not satisfy its bound: {missing}",
                        arg.display(),
                        p.name.node
                    ),
                    span,
                ));
            }
        }
        subst.insert(p.name.node.clone(), arg.clone());
    }

    let target_ty = Type::Nominal {
        decl: target_id,
        name: target_name.clone(),
        args: Vec::new(),
    };
    let members = resolver.member_table(&target_ty).unwrap_or_default();

    let mut ops = Vec::with_capacity(template.ops.len());
    for op in &template.ops {
        let mut params = Vec::with_capacity(op.params.len());
        for p in &op.params {
            params.push(resolver.resolve_type_expr_with(&p.ty, template_scope, &subst)?);
        }
        let ret = match &op.ret {
            Some(te) => resolver.resolve_type_expr_with(te, template_scope, &subst)?,
            None => Type::unit(),
        };
        let op_meta = Metadata::parse_quiet(&op.annotations);
        let required = Type::Function {
            params,
            ret: Box::new(ret),
            effects: declared_effect_set(&op_meta),
        };

        if let Some(member) = members.iter().find(|m| m.name == op.name.node) {
            if !resolver.types_compatible(&required, &member.ty) {
                return Err(SemanticError::new(
                    ErrorKind::SignatureMismatch,
                    format!(
                        "'{target_name}.{}' has signature {}, but template '{template_name}' requires {}",
                        op.name.node,
                        member.ty.display(),
                        required.display()
                    ),
                    span,
                ));
            }
            ops.push(ExpandedOp {
                name: op.name.node.clone(),
                ty: required,
                provided_by: Provided::Target,
                span: op.span,
            });
        } else if op.default_body.is_some() {
            ops.push(ExpandedOp {
                name: op.name.node.clone(),
                ty: required,
                provided_by: Provided::TemplateDefault,
                span: op.span,
            });
        } else {
            return Err(SemanticError::new(
                ErrorKind::IncompleteInstance,
                format!(
                    "'{target_name}' does not provide operation '{}' required by template '{template_name}', and the template declares no default",
                    op.name.node
                ),
                span,
            ));
        }
    }

    Ok(ExpandedInstance {
        instance: id,
        template: template_id,
        target: target_id,
        args,
        ops,
        verifies: template_meta.verifies.clone(),
    })
}

fn resolve_local(
    resolver: &Resolver<'_>,
    name: &oath_ast::Ident,
    scope: crate::symbols::ScopeId,
) -> Result<DeclId, SemanticError> {
    match resolver.symbols.resolve_spanned(&name.node, scope, name.span)? {
        SymbolRef::Local(id) => Ok(id),
        SymbolRef::Global(q) => Err(SemanticError::new(
            ErrorKind::SignatureMismatch,
            format!("'{q}' is declared in another unit; instances bind within their own unit"),
            name.span,
        )),
    }
}

/// Two instances on the same target may not both supply a defaulted
/// operation of the same name unless the target overrides it itself.
fn detect_default_conflicts(
    resolver: &Resolver<'_>,
    expanded: &[ExpandedInstance],
    errors: &mut Vec<SemanticError>,
) {
    let mut defaults: HashMap<(DeclId, String), Vec<&ExpandedInstance>> = HashMap::new();
    for inst in expanded {
        for op in &inst.ops {
            if op.provided_by == Provided::TemplateDefault {
                defaults
                    .entry((inst.target, op.name.clone()))
                    .or_default()
                    .push(inst);
            }
        }
    }
    for ((target, op_name), providers) in defaults {
        if providers.len() < 2 {
            continue;
        }
        let target_entry = resolver.table.get(target);
        let names: Vec<String> = providers
            .iter()
            .map(|i| resolver.table.get(i.template).name.clone())
            .collect();
        errors.push(SemanticError::new(
            ErrorKind::TemplateConflict,
            format!(
                "templates {} each provide a default for '{}' on '{}'; the target must override it",
                names.join(" and "),
                op_name,
                target_entry.name
            ),
            target_entry.span,
        ));
    }
}
