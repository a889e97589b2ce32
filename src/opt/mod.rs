//! # Optimizer
//!
//! Passes transform one function at a time (`fn(&mut Context, &mut Function,
//! &PassArgs) -> bool`, returning whether the IR changed) or, for
//! interprocedural work, a whole module. Passes self-register into a global
//! registry under a name, a category and an argument schema; a [`Pipeline`]
//! is parsed from a specification string and applied in order. Cached CFG
//! analyses are invalidated by the mutation APIs themselves, so the runner
//! only tracks change reporting and the fixpoint budget.
//!
//! ## Pipeline specifications
//!
//! A specification is a comma-separated sequence of pass names. A
//! parenthesized group runs its members to a fixpoint (bounded by the pass
//! budget). Passes accept `name(key=value, ...)` arguments per their
//! declared schema:
//!
//! ```text
//! mem2reg,(constfold,instcombine,dce,simplifycfg),rotateloops
//! ```

mod constfold;
mod dce;
mod inline;
mod instcombine;
mod loop_rotate;
mod mem2reg;
mod redundancy;
mod simplifycfg;

pub use constfold::constfold;
pub use dce::dce;
pub use inline::inline_functions;
pub use instcombine::instcombine;
pub use loop_rotate::rotate_loops;
pub use mem2reg::mem2reg;
pub use redundancy::redundancy_elim;
pub use simplifycfg::simplify_cfg;

use std::collections::HashMap;

use lazy_static::lazy_static;
use tracing::debug;

use crate::error::PipelineError;
use crate::ir::{Context, Function, Module};

/// Pass categories, for tooling and registry listings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassCategory {
    /// Reshapes the CFG into canonical forms other passes rely on
    Canonicalization,
    /// Removes or simplifies instructions
    Simplification,
    /// Computes information without transforming
    Analysis,
    /// Everything else
    Other,
}

/// Parsed `key=value` arguments of one pass invocation
#[derive(Debug, Clone, Default)]
pub struct PassArgs {
    values: HashMap<String, String>,
}

impl PassArgs {
    /// Numeric argument with a default
    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.values
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }
}

/// The callable of a pass
#[derive(Clone, Copy)]
pub enum PassFn {
    /// Runs on one function
    Function(fn(&mut Context, &mut Function, &PassArgs) -> bool),
    /// Runs on the whole module (interprocedural passes)
    Module(fn(&mut Context, &mut Module, &PassArgs) -> bool),
}

/// Registry entry of a pass
pub struct PassInfo {
    /// Registry name
    pub name: &'static str,
    /// Category
    pub category: PassCategory,
    /// Accepted argument keys with their defaults
    pub arg_schema: &'static [(&'static str, &'static str)],
    /// The callable
    pub run: PassFn,
}

lazy_static! {
    static ref REGISTRY: Vec<PassInfo> = vec![
        PassInfo {
            name: "mem2reg",
            category: PassCategory::Canonicalization,
            arg_schema: &[],
            run: PassFn::Function(mem2reg),
        },
        PassInfo {
            name: "dce",
            category: PassCategory::Simplification,
            arg_schema: &[],
            run: PassFn::Function(dce),
        },
        PassInfo {
            name: "constfold",
            category: PassCategory::Simplification,
            arg_schema: &[],
            run: PassFn::Function(constfold),
        },
        PassInfo {
            name: "instcombine",
            category: PassCategory::Simplification,
            arg_schema: &[],
            run: PassFn::Function(instcombine),
        },
        PassInfo {
            name: "simplifycfg",
            category: PassCategory::Simplification,
            arg_schema: &[],
            run: PassFn::Function(simplify_cfg),
        },
        PassInfo {
            name: "redundancyelim",
            category: PassCategory::Simplification,
            arg_schema: &[],
            run: PassFn::Function(redundancy_elim),
        },
        PassInfo {
            name: "rotateloops",
            category: PassCategory::Canonicalization,
            arg_schema: &[],
            run: PassFn::Function(rotate_loops),
        },
        PassInfo {
            name: "inline",
            category: PassCategory::Other,
            arg_schema: &[("budget", "60")],
            run: PassFn::Module(inline_functions),
        },
    ];
}

/// Look a pass up by name
pub fn find_pass(name: &str) -> Option<&'static PassInfo> {
    REGISTRY.iter().find(|p| p.name == name)
}

/// All registered passes
pub fn registered_passes() -> &'static [PassInfo] {
    &REGISTRY
}

/// One element of a parsed pipeline
enum PipelineNode {
    Pass(&'static PassInfo, PassArgs),
    /// Run the children to a fixpoint
    Fixpoint(Vec<PipelineNode>),
}

/// A parsed sequence of pass invocations
pub struct Pipeline {
    nodes: Vec<PipelineNode>,
    /// Upper bound on fixpoint iterations per group
    pub budget: usize,
}

impl Pipeline {
    /// Parse a pipeline specification string
    pub fn parse(spec: &str) -> Result<Self, PipelineError> {
        let mut parser = SpecParser {
            input: spec,
            pos: 0,
        };
        let nodes = parser.sequence(false)?;
        parser.skip_ws();
        if parser.pos != spec.len() {
            return Err(PipelineError::Parse {
                position: parser.pos,
                message: "trailing input".to_string(),
            });
        }
        Ok(Pipeline { nodes, budget: 16 })
    }

    /// The default `-O` pipeline
    pub fn default_optimization() -> Self {
        Pipeline::parse(
            "inline,mem2reg,(constfold,instcombine,dce,simplifycfg),\
             redundancyelim,rotateloops,(constfold,instcombine,dce,simplifycfg)",
        )
        .expect("default pipeline must parse")
    }

    /// Apply the pipeline to every function of the module. Returns whether
    /// anything changed.
    pub fn run(&self, ctx: &mut Context, module: &mut Module) -> bool {
        run_nodes(&self.nodes, self.budget, ctx, module)
    }
}

fn run_nodes(
    nodes: &[PipelineNode],
    budget: usize,
    ctx: &mut Context,
    module: &mut Module,
) -> bool {
    let mut any = false;
    for node in nodes {
        match node {
            PipelineNode::Pass(info, args) => {
                let changed = run_single(info, args, ctx, module);
                if changed {
                    debug!(pass = info.name, "pass changed IR");
                }
                any |= changed;
            }
            PipelineNode::Fixpoint(children) => {
                // Stop at a fixed point within the group or when the
                // configured budget is exhausted
                for _ in 0..budget {
                    if !run_nodes(children, budget, ctx, module) {
                        break;
                    }
                    any = true;
                }
            }
        }
    }
    any
}

fn run_single(info: &PassInfo, args: &PassArgs, ctx: &mut Context, module: &mut Module) -> bool {
    match info.run {
        PassFn::Function(f) => {
            let mut changed = false;
            for id in module.function_ids() {
                changed |= f(ctx, module.function_mut(id), args);
            }
            changed
        }
        PassFn::Module(f) => f(ctx, module, args),
    }
}

struct SpecParser<'a> {
    input: &'a str,
    pos: usize,
}

impl SpecParser<'_> {
    fn skip_ws(&mut self) {
        while self.input[self.pos..].starts_with(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn sequence(&mut self, nested: bool) -> Result<Vec<PipelineNode>, PipelineError> {
        let mut nodes = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some('(') => {
                    self.pos += 1;
                    let children = self.sequence(true)?;
                    if self.peek() != Some(')') {
                        return Err(PipelineError::Parse {
                            position: self.pos,
                            message: "expected ')'".to_string(),
                        });
                    }
                    self.pos += 1;
                    nodes.push(PipelineNode::Fixpoint(children));
                }
                Some(c) if c.is_alphanumeric() || c == '_' => {
                    nodes.push(self.pass()?);
                }
                _ => {
                    return Err(PipelineError::Parse {
                        position: self.pos,
                        message: "expected pass name".to_string(),
                    })
                }
            }
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.pos += 1;
                }
                Some(')') if nested => return Ok(nodes),
                None if !nested => return Ok(nodes),
                None => {
                    return Err(PipelineError::Parse {
                        position: self.pos,
                        message: "unclosed group".to_string(),
                    })
                }
                Some(c) => {
                    return Err(PipelineError::Parse {
                        position: self.pos,
                        message: format!("unexpected '{c}'"),
                    })
                }
            }
        }
    }

    fn ident(&mut self) -> String {
        let start = self.pos;
        while self
            .peek()
            .map(|c| c.is_alphanumeric() || c == '_')
            .unwrap_or(false)
        {
            self.pos += 1;
        }
        self.input[start..self.pos].to_string()
    }

    fn pass(&mut self) -> Result<PipelineNode, PipelineError> {
        let name = self.ident();
        let info = find_pass(&name).ok_or(PipelineError::UnknownPass(name))?;
        self.skip_ws();
        if self.peek() == Some('(') {
            // Distinguish argument lists from fixpoint groups: arguments are
            // always `key=value` pairs
            let save = self.pos;
            self.pos += 1;
            self.skip_ws();
            let key = self.ident();
            self.skip_ws();
            if self.peek() == Some('=') {
                self.pos += 1;
                return self.finish_args(info, PassArgs::default(), key);
            }
            // Not an argument list; rewind and let the caller treat the
            // parenthesis as a group
            self.pos = save;
        }
        Ok(PipelineNode::Pass(info, PassArgs::default()))
    }

    fn finish_args(
        &mut self,
        info: &'static PassInfo,
        mut args: PassArgs,
        pending_key: String,
    ) -> Result<PipelineNode, PipelineError> {
        let mut key = pending_key;
        loop {
            self.skip_ws();
            let start = self.pos;
            while self.peek().map(|c| c != ',' && c != ')').unwrap_or(false) {
                self.pos += 1;
            }
            let value = self.input[start..self.pos].trim().to_string();
            args.values.insert(key, value);
            match self.peek() {
                Some(',') => {
                    self.pos += 1;
                    self.skip_ws();
                    key = self.ident();
                    self.skip_ws();
                    if self.peek() != Some('=') {
                        return Err(PipelineError::Parse {
                            position: self.pos,
                            message: "expected '='".to_string(),
                        });
                    }
                    self.pos += 1;
                }
                Some(')') => {
                    self.pos += 1;
                    return Ok(PipelineNode::Pass(info, args));
                }
                _ => {
                    return Err(PipelineError::Parse {
                        position: self.pos,
                        message: "unterminated argument list".to_string(),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_sequence() {
        let p = Pipeline::parse("mem2reg,dce").unwrap();
        assert_eq!(p.nodes.len(), 2);
    }

    #[test]
    fn parses_fixpoint_group() {
        let p = Pipeline::parse("mem2reg,(constfold,dce),simplifycfg").unwrap();
        assert_eq!(p.nodes.len(), 3);
        assert!(matches!(p.nodes[1], PipelineNode::Fixpoint(_)));
    }

    #[test]
    fn parses_pass_arguments() {
        let p = Pipeline::parse("inline(budget=120)").unwrap();
        match &p.nodes[0] {
            PipelineNode::Pass(info, args) => {
                assert_eq!(info.name, "inline");
                assert_eq!(args.get_u64("budget", 60), 120);
            }
            _ => panic!("expected pass node"),
        }
    }

    #[test]
    fn rejects_unknown_pass() {
        assert!(matches!(
            Pipeline::parse("nosuchpass"),
            Err(PipelineError::UnknownPass(_))
        ));
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(Pipeline::parse("dce)").is_err());
        assert!(Pipeline::parse("(dce").is_err());
    }

    #[test]
    fn default_pipeline_parses() {
        let _ = Pipeline::default_optimization();
    }
}
