//! Recipes: ordered remote commands per phase and role.
//!
//! A `RecipeSpec` is what gets registered; it is resolved into a concrete
//! `Recipe` for one host just before execution. The only step that depends on
//! run state is `Step::Join`, which becomes the worker's join command once the
//! master has produced a credential. Nothing else is interpreted: command text
//! is opaque to the engine.

pub mod kubeadm;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::join::JoinCredential;
use crate::error::{Error, Result};
use crate::inventory::{Host, Role};


// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Preparation,
    MasterInit,
    WorkerJoin,
    Verification,
    Reset,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Preparation => "preparation",
            Phase::MasterInit => "master_init",
            Phase::WorkerJoin => "worker_join",
            Phase::Verification => "verification",
            Phase::Reset => "reset",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


// ---------------------------------------------------------------------------
// RemoteCommand / Recipe
// ---------------------------------------------------------------------------

/// One command line. A failing critical command ends the recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCommand {
    pub text: String,
    pub critical: bool,
}

impl RemoteCommand {
    pub fn critical(text: &str) -> Self {
        RemoteCommand {
            text: text.to_string(),
            critical: true,
        }
    }

    /// A command whose failure is logged and skipped, e.g. cleanup of
    /// something that may not exist.
    pub fn best_effort(text: &str) -> Self {
        RemoteCommand {
            text: text.to_string(),
            critical: false,
        }
    }
}

/// A recipe resolved for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
    pub phase: Phase,
    pub commands: Vec<RemoteCommand>,
}

impl Recipe {
    pub fn new(phase: Phase, commands: Vec<RemoteCommand>) -> Self {
        Recipe { phase, commands }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}


// ---------------------------------------------------------------------------
// RecipeSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Run(RemoteCommand),
    /// The worker join command, built from the run's credential. Skipped on
    /// hosts where `skip_if_exists` is already present.
    Join { skip_if_exists: Option<String> },
}

/// What gets resolved for a host.
pub struct RecipeContext<'a> {
    pub host: &'a Host,
    pub credential: Option<&'a JoinCredential>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecipeSpec {
    pub steps: Vec<Step>,
}

impl RecipeSpec {
    pub fn new(steps: Vec<Step>) -> Self {
        RecipeSpec { steps }
    }

    pub fn commands(commands: Vec<RemoteCommand>) -> Self {
        RecipeSpec {
            steps: commands.into_iter().map(Step::Run).collect(),
        }
    }

    pub fn needs_credential(&self) -> bool {
        self.steps.iter().any(|s| matches!(s, Step::Join { .. }))
    }

    pub fn resolve(&self, phase: Phase, ctx: &RecipeContext<'_>) -> Result<Recipe> {
        let mut commands = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            match step {
                Step::Run(cmd) => commands.push(cmd.clone()),
                Step::Join { skip_if_exists } => {
                    let credential = ctx.credential.ok_or_else(|| {
                        Error::Recipe(format!(
                            "{} recipe for {} needs a join credential",
                            phase, ctx.host.name
                        ))
                    })?;
                    let join = credential.join_command();
                    let text = match skip_if_exists {
                        Some(path) => format!("test -e {} || {}", path, join),
                        None => join,
                    };
                    commands.push(RemoteCommand::critical(&text));
                }
            }
        }
        Ok(Recipe::new(phase, commands))
    }
}


// ---------------------------------------------------------------------------
// RecipeRegistry
// ---------------------------------------------------------------------------

/// Recipes keyed by `(phase, role)`. A missing entry resolves to an empty
/// recipe, which succeeds trivially.
#[derive(Debug, Clone, Default)]
pub struct RecipeRegistry {
    specs: HashMap<(Phase, Role), RecipeSpec>,
}

impl RecipeRegistry {
    pub fn new() -> Self {
        RecipeRegistry::default()
    }

    pub fn register(&mut self, phase: Phase, role: Role, spec: RecipeSpec) -> &mut Self {
        self.specs.insert((phase, role), spec);
        self
    }

    pub fn get(&self, phase: Phase, role: Role) -> Option<&RecipeSpec> {
        self.specs.get(&(phase, role))
    }

    pub fn resolve(
        &self,
        phase: Phase,
        host: &Host,
        credential: Option<&JoinCredential>,
    ) -> Result<Recipe> {
        match self.get(phase, host.role) {
            Some(spec) => spec.resolve(phase, &RecipeContext { host, credential }),
            None => Ok(Recipe::new(phase, Vec::new())),
        }
    }

    /// Replace entries with those from a YAML recipe file:
    ///
    /// ```yaml
    /// preparation:
    ///   worker:
    ///     - run: swapoff -a
    ///     - run: rm -rf /tmp/stale
    ///       critical: false
    /// worker_join:
    ///   worker:
    ///     - join: true
    ///       skip_if_exists: /etc/kubernetes/kubelet.conf
    /// ```
    pub fn apply_yaml(&mut self, text: &str) -> Result<()> {
        let doc: HashMap<Phase, HashMap<Role, Vec<StepDoc>>> =
            serde_yaml::from_str(text).map_err(|e| Error::Recipe(e.to_string()))?;
        for (phase, roles) in doc {
            for (role, steps) in roles {
                let steps = steps
                    .into_iter()
                    .map(StepDoc::into_step)
                    .collect::<Result<Vec<_>>>()?;
                self.register(phase, role, RecipeSpec::new(steps));
            }
        }
        Ok(())
    }

    pub fn apply_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Recipe(format!("cannot read {}: {}", path.display(), e)))?;
        self.apply_yaml(&text)
    }
}

fn yes() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepDoc {
    run: Option<String>,
    #[serde(default)]
    join: bool,
    #[serde(default = "yes")]
    critical: bool,
    skip_if_exists: Option<String>,
}

impl StepDoc {
    fn into_step(self) -> Result<Step> {
        match (self.run, self.join) {
            (Some(text), false) => Ok(Step::Run(RemoteCommand {
                text,
                critical: self.critical,
            })),
            (None, true) => Ok(Step::Join {
                skip_if_exists: self.skip_if_exists,
            }),
            (Some(_), true) => Err(Error::Recipe("step has both `run` and `join`".into())),
            (None, false) => Err(Error::Recipe("step needs `run` or `join: true`".into())),
        }
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
