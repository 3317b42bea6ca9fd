use std::{
    collections::{HashMap, HashSet},
    rc::Rc,
};

use muster_foundation::errors::{pipe_all_diagnostics_into, Diagnostic, DiagnosticSink};
use muster_scheduler::{Extension, GoalKey, PassContext, PassOutcome, Pipeline, UnitKey};

use crate::input::Input;

/// AST of one module, in whichever shape its passes have gotten it to so far.
#[derive(Debug)]
pub enum ModuleAst {
    Source { text: String },
    Parsed(Module),
}

#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub extends: Option<String>,
    pub consts: Vec<Const>,
}

#[derive(Debug, Clone)]
pub struct Const {
    pub name: String,
    pub value: String,
}

/// The pipeline for `module` units.
///
/// The barrier guarantees that by the time any module resolves its base, every module known to
/// the session has published its member list.
pub fn module_pipeline() -> Pipeline {
    Pipeline::new()
        .then("parse")
        .then("members")
        .barrier("members")
        .then("resolve")
        .then("check")
}

/// Parses module source text.
///
/// The syntax is line-based: a `module Name` or `module Name extends Base` header followed by
/// `const NAME = value` lines. `#` starts a comment that runs to the end of the line.
pub fn parse_module(text: &str, diagnostics: &mut dyn DiagnosticSink) -> Option<Module> {
    let mut module: Option<Module> = None;
    let mut seen_consts = HashSet::new();
    let mut ok = true;

    for (index, raw) in text.lines().enumerate() {
        let line_number = index + 1;
        let line = raw.split('#').next().unwrap_or(raw).trim();
        let Some(first) = line.split_whitespace().next() else {
            continue;
        };
        match first {
            "module" => {
                if module.is_some() {
                    diagnostics.emit(Diagnostic::error(format!(
                        "line {line_number}: more than one `module` header"
                    )));
                    ok = false;
                    continue;
                }
                let mut words = line["module".len()..].split_whitespace();
                let (name, extends) = match (words.next(), words.next(), words.next(), words.next())
                {
                    (Some(name), None, ..) => (name, None),
                    (Some(name), Some("extends"), Some(base), None) => (name, Some(base)),
                    _ => {
                        diagnostics.emit(Diagnostic::error(format!(
                            "line {line_number}: expected `module Name` or \
                             `module Name extends Base`"
                        )));
                        ok = false;
                        continue;
                    }
                };
                module = Some(Module {
                    name: name.to_owned(),
                    extends: extends.map(str::to_owned),
                    consts: vec![],
                });
            }
            "const" => {
                let Some(module) = &mut module else {
                    diagnostics.emit(Diagnostic::error(format!(
                        "line {line_number}: `const` before the `module` header"
                    )));
                    ok = false;
                    continue;
                };
                let declaration = line["const".len()..].trim();
                let valid = declaration
                    .split_once('=')
                    .map(|(name, value)| (name.trim(), value.trim()))
                    .filter(|(name, value)| {
                        !name.is_empty()
                            && !name.contains(char::is_whitespace)
                            && !value.is_empty()
                    });
                let Some((name, value)) = valid else {
                    diagnostics.emit(Diagnostic::error(format!(
                        "line {line_number}: expected `const NAME = value`"
                    )));
                    ok = false;
                    continue;
                };
                if !seen_consts.insert(name.to_owned()) {
                    diagnostics.emit(Diagnostic::error(format!(
                        "line {line_number}: const `{name}` is defined twice"
                    )));
                    ok = false;
                    continue;
                }
                module.consts.push(Const {
                    name: name.to_owned(),
                    value: value.to_owned(),
                });
            }
            _ => {
                diagnostics.emit(Diagnostic::error(format!(
                    "line {line_number}: unrecognized directive `{first}`"
                )));
                ok = false;
            }
        }
    }

    if module.is_none() {
        diagnostics.emit(Diagnostic::error("missing `module` header"));
        return None;
    }
    if ok {
        module
    } else {
        None
    }
}

/// What the session has learned about a module so far, published by its `members` pass and read
/// by every other module's `resolve` and `check` passes.
#[derive(Debug, Clone, Default)]
struct ModuleFacts {
    extends: Option<String>,
    consts: Vec<String>,
}

pub struct ModuleExtension {
    input: Input,
    modules: HashMap<String, ModuleFacts>,
}

impl ModuleExtension {
    pub fn new(input: Input) -> Self {
        Self {
            input,
            modules: HashMap::new(),
        }
    }
}

impl Extension for ModuleExtension {
    type Ast = ModuleAst;

    fn execute_pass(
        &mut self,
        goal: &GoalKey,
        ast: &mut ModuleAst,
        cx: &mut PassContext<'_, ModuleAst>,
    ) -> PassOutcome {
        match &*goal.kind {
            "parse" => self.parse(ast, cx),
            "members" => self.members(ast, cx),
            "resolve" => self.resolve(ast, cx),
            "check" => self.check(ast, cx),
            other => {
                cx.emit(Diagnostic::bug(format!("pass `{other}` is not implemented")));
                PassOutcome::Failure
            }
        }
    }

    fn locate_goal(&mut self, goal: &GoalKey) -> Option<(UnitKey, Rc<str>)> {
        goal.param
            .as_deref()
            .map(|name| (UnitKey::new(name), Rc::from("module")))
    }

    fn load_unit(&mut self, key: &UnitKey, _kind: &str) -> Option<ModuleAst> {
        self.input
            .source(key.as_str())
            .map(|text| ModuleAst::Source { text })
    }
}

/// # Pass implementations
impl ModuleExtension {
    fn parse(&mut self, ast: &mut ModuleAst, cx: &mut PassContext<'_, ModuleAst>) -> PassOutcome {
        let ModuleAst::Source { text } = ast else {
            // Already parsed on an earlier attempt of this pass.
            return PassOutcome::Success;
        };

        let mut parse_diagnostics = vec![];
        let module = parse_module(text, &mut parse_diagnostics);
        let unit = cx.unit_key().as_str().to_owned();
        pipe_all_diagnostics_into(
            cx,
            parse_diagnostics
                .into_iter()
                .map(|diagnostic| diagnostic.in_unit(&*unit).during("parse")),
        );
        let Some(module) = module else {
            return PassOutcome::Failure;
        };

        if module.name != unit {
            cx.emit(
                Diagnostic::warning(format!(
                    "module is named `{}` but lives in a file named `{unit}`",
                    module.name,
                ))
                .in_unit(unit)
                .during("parse"),
            );
        }
        *ast = ModuleAst::Parsed(module);
        PassOutcome::Success
    }

    fn members(&mut self, ast: &mut ModuleAst, cx: &mut PassContext<'_, ModuleAst>) -> PassOutcome {
        let Some(module) = parsed(ast, cx) else {
            return PassOutcome::Failure;
        };
        self.modules.insert(
            module.name.clone(),
            ModuleFacts {
                extends: module.extends.clone(),
                consts: module.consts.iter().map(|c| c.name.clone()).collect(),
            },
        );
        PassOutcome::Success
    }

    /// Walks the inheritance chain, requesting the members of each base module that has not
    /// published them yet. Bases that cannot be found anywhere end the chain with an error.
    fn resolve(&mut self, ast: &mut ModuleAst, cx: &mut PassContext<'_, ModuleAst>) -> PassOutcome {
        let Some(module) = parsed(ast, cx) else {
            return PassOutcome::Failure;
        };

        let mut seen = HashSet::new();
        seen.insert(module.name.clone());
        let mut current = module.extends.clone();
        while let Some(base) = current {
            if !seen.insert(base.clone()) {
                cx.emit(
                    Diagnostic::error(format!("inheritance cycle through `{base}`"))
                        .in_unit(&*module.name)
                        .during("resolve"),
                );
                return PassOutcome::Failure;
            }
            match self.modules.get(&base) {
                Some(facts) => current = facts.extends.clone(),
                None => {
                    let goal = GoalKey::of("members", &*base);
                    if cx.is_denied(&goal) {
                        cx.emit(
                            Diagnostic::error(format!("unknown base module `{base}`"))
                                .in_unit(&*module.name)
                                .during("resolve"),
                        );
                        return PassOutcome::Failure;
                    }
                    return PassOutcome::NeedsGoal {
                        goal,
                        mandatory: true,
                    };
                }
            }
        }
        PassOutcome::Success
    }

    fn check(&mut self, ast: &mut ModuleAst, cx: &mut PassContext<'_, ModuleAst>) -> PassOutcome {
        let Some(module) = parsed(ast, cx) else {
            return PassOutcome::Failure;
        };

        // resolve guaranteed the chain is fully published and acyclic.
        let mut inherited = HashMap::new();
        let mut current = module.extends.clone();
        while let Some(base) = current {
            let Some(facts) = self.modules.get(&base) else {
                cx.emit(Diagnostic::bug(format!(
                    "members of `{base}` vanished between resolve and check"
                )));
                return PassOutcome::Failure;
            };
            for name in &facts.consts {
                inherited.entry(name.clone()).or_insert_with(|| base.clone());
            }
            current = facts.extends.clone();
        }

        for constant in &module.consts {
            if let Some(origin) = inherited.get(&constant.name) {
                cx.emit(
                    Diagnostic::warning(format!(
                        "const `{}` shadows the one inherited from `{origin}`",
                        constant.name,
                    ))
                    .in_unit(&*module.name)
                    .during("check"),
                );
            }
        }
        PassOutcome::Success
    }
}

fn parsed<'m>(ast: &'m mut ModuleAst, cx: &mut PassContext<'_, ModuleAst>) -> Option<&'m Module> {
    match ast {
        ModuleAst::Parsed(module) => Some(module),
        ModuleAst::Source { .. } => {
            cx.emit(Diagnostic::bug(format!(
                "module `{}` reached a later pass without being parsed",
                cx.unit_key(),
            )));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use muster_scheduler::Scheduler;

    use super::*;

    fn parse(text: &str) -> (Option<Module>, Vec<Diagnostic>) {
        let mut diagnostics = vec![];
        let module = parse_module(text, &mut diagnostics);
        (module, diagnostics)
    }

    #[test]
    fn parses_header_and_consts() {
        let (module, diagnostics) = parse(indoc! {"
            # a pawn
            module Pawn extends Actor

            const SPEED = 10
            const NAME = Fred Smith  # spaces are fine in values
        "});
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        let module = module.unwrap();
        assert_eq!(module.name, "Pawn");
        assert_eq!(module.extends.as_deref(), Some("Actor"));
        assert_eq!(module.consts.len(), 2);
        assert_eq!(module.consts[1].name, "NAME");
        assert_eq!(module.consts[1].value, "Fred Smith");
    }

    #[test]
    fn rejects_malformed_input() {
        for (text, expected) in [
            ("const X = 1", "before the `module` header"),
            ("frobnicate", "unrecognized directive"),
            ("module", "expected `module Name`"),
            ("module A extends", "expected `module Name`"),
            ("", "missing `module` header"),
            ("module A\nconst X = 1\nconst X = 2", "defined twice"),
            ("module A\nconst X =", "expected `const NAME = value`"),
        ] {
            let (module, diagnostics) = parse(text);
            assert!(module.is_none(), "{text:?} should not parse");
            assert!(
                diagnostics
                    .iter()
                    .any(|d| d.is_error() && d.message.contains(expected)),
                "{text:?} should report {expected:?}, got {diagnostics:?}"
            );
        }
    }

    fn session(modules: &[(&str, &str)]) -> (Scheduler<ModuleAst>, ModuleExtension) {
        let mut scheduler = Scheduler::new();
        scheduler
            .register_pipeline("module", module_pipeline())
            .unwrap();
        for (name, text) in modules {
            scheduler
                .add_unit(
                    UnitKey::new(*name),
                    "module",
                    ModuleAst::Source {
                        text: (*text).to_owned(),
                    },
                )
                .unwrap();
        }
        (scheduler, ModuleExtension::new(Input::new()))
    }

    #[test]
    fn inheritance_resolves_across_modules() {
        let (mut scheduler, mut ext) = session(&[
            (
                "Pawn",
                indoc! {"
                    module Pawn extends Actor
                    const SPEED = 10
                "},
            ),
            (
                "Actor",
                indoc! {"
                    module Actor
                    const HEALTH = 100
                "},
            ),
        ]);
        assert!(scheduler.run_to_completion(&mut ext).unwrap());
        assert!(scheduler.diagnostics.is_empty(), "{:?}", scheduler.diagnostics);
    }

    #[test]
    fn shadowing_an_inherited_const_warns() {
        let (mut scheduler, mut ext) = session(&[
            (
                "Pawn",
                indoc! {"
                    module Pawn extends Actor
                    const HEALTH = 50
                "},
            ),
            (
                "Actor",
                indoc! {"
                    module Actor
                    const HEALTH = 100
                "},
            ),
        ]);
        assert!(scheduler.run_to_completion(&mut ext).unwrap());
        assert_eq!(scheduler.diagnostics.len(), 1);
        assert!(scheduler.diagnostics[0].message.contains("shadows"));
        assert!(!scheduler.diagnostics[0].is_error());
    }

    #[test]
    fn unknown_base_module_is_reported() {
        let (mut scheduler, mut ext) = session(&[(
            "Orphan",
            "module Orphan extends Missing\n",
        )]);
        assert!(!scheduler.run_to_completion(&mut ext).unwrap());
        assert!(scheduler
            .diagnostics
            .iter()
            .any(|d| d.is_error() && d.message.contains("unknown base module `Missing`")));
    }

    #[test]
    fn inheritance_cycles_are_reported() {
        let (mut scheduler, mut ext) = session(&[
            ("A", "module A extends B\n"),
            ("B", "module B extends A\n"),
        ]);
        assert!(!scheduler.run_to_completion(&mut ext).unwrap());
        assert!(scheduler
            .diagnostics
            .iter()
            .any(|d| d.is_error() && d.message.contains("inheritance cycle")));
    }
}
