//! Engine configuration
//!
//! [`ForgeConfig`] is plain serde data with `with_*` builders. It loads from
//! TOML; every section and field is optional and falls back to its default.
//!
//! ```toml
//! [build]
//! max_parallelism = 8
//! tournament_candidates = 2
//!
//! [budget]
//! max_cost_usd = 25.0
//!
//! [phases]
//! functional_commands = ["npm test"]
//! ```

use crate::error::{ForgeError, ForgeResult};
use crate::escalation::EscalationLevel;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// Parallel build settings
    pub build: BuildConfig,
    /// Verification swarm settings
    pub swarm: SwarmConfig,
    /// Escalation ladder budgets
    pub escalation: EscalationConfig,
    /// Abort budgets
    pub budget: BudgetConfig,
    /// Contract engine settings
    pub contract: ContractConfig,
    /// Per-phase commands and switches
    pub phases: PhaseConfig,
}

impl ForgeConfig {
    /// Default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML and validate
    ///
    /// # Errors
    /// [`ForgeError::Config`] on syntax errors or invalid values
    pub fn from_toml_str(raw: &str) -> ForgeResult<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| ForgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// [`ForgeError::Config`] if the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> ForgeResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ForgeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// With max in-flight generation calls
    #[inline]
    #[must_use]
    pub fn with_max_parallelism(mut self, max: usize) -> Self {
        self.build.max_parallelism = max;
        self
    }

    /// With agents per component
    #[inline]
    #[must_use]
    pub fn with_agents_per_component(mut self, agents: usize) -> Self {
        self.build.agents_per_component = agents;
        self
    }

    /// With tournament candidates per component
    #[inline]
    #[must_use]
    pub fn with_tournament_candidates(mut self, candidates: usize) -> Self {
        self.build.tournament_candidates = candidates;
        self
    }

    /// With generation timeout
    #[inline]
    #[must_use]
    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.build.generation_timeout_ms = duration_ms(timeout);
        self
    }

    /// With checker timeout
    #[inline]
    #[must_use]
    pub fn with_checker_timeout(mut self, timeout: Duration) -> Self {
        self.swarm.checker_timeout_ms = duration_ms(timeout);
        self
    }

    /// With one budget for levels 1 through 3
    #[inline]
    #[must_use]
    pub fn with_uniform_escalation_budget(mut self, attempts: u32) -> Self {
        self.escalation.local_fix_attempts = attempts;
        self.escalation.component_fix_attempts = attempts;
        self.escalation.component_rewrite_attempts = attempts;
        self
    }

    /// With cost ceiling
    #[inline]
    #[must_use]
    pub fn with_max_cost_usd(mut self, cost: f64) -> Self {
        self.budget.max_cost_usd = Some(cost);
        self
    }

    /// With satisfaction round ceiling
    #[inline]
    #[must_use]
    pub fn with_max_satisfaction_rounds(mut self, rounds: u32) -> Self {
        self.budget.max_satisfaction_rounds = rounds;
        self
    }

    /// With functional test commands
    #[inline]
    #[must_use]
    pub fn with_functional_commands(mut self, commands: Vec<String>) -> Self {
        self.phases.functional_commands = commands;
        self
    }

    /// With secrets required at INIT
    #[inline]
    #[must_use]
    pub fn with_required_secrets(mut self, secrets: Vec<String>) -> Self {
        self.phases.required_secrets = secrets;
        self
    }

    /// Reject values the engine cannot run with
    ///
    /// # Errors
    /// [`ForgeError::Config`] naming the first offending field
    pub fn validate(&self) -> ForgeResult<()> {
        let fail = |msg: &str| Err(ForgeError::Config(msg.to_string()));
        if self.build.max_parallelism == 0 {
            return fail("build.max_parallelism must be at least 1");
        }
        if self.build.agents_per_component == 0 {
            return fail("build.agents_per_component must be at least 1");
        }
        if self.build.tournament_candidates == 0 {
            return fail("build.tournament_candidates must be at least 1 (1 disables tournaments)");
        }
        if self.build.generation_timeout_ms == 0 || self.swarm.checker_timeout_ms == 0 {
            return fail("timeouts must be positive");
        }
        let t = &self.swarm.thresholds;
        for (name, value) in [
            ("structural_quality", t.structural_quality),
            ("visual_design", t.visual_design),
            ("style_consistency", t.style_consistency),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ForgeError::Config(format!(
                    "swarm.thresholds.{name} must be within 0..=100, got {value}"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.contract.ambiguity_threshold) {
            return fail("contract.ambiguity_threshold must be within 0..=1");
        }
        if self.escalation.feature_rewrite_attempts == 0 {
            return fail("escalation.feature_rewrite_attempts must be at least 1");
        }
        if matches!(self.budget.max_cost_usd, Some(c) if c <= 0.0) {
            return fail("budget.max_cost_usd must be positive");
        }
        if self.budget.max_driver_steps == 0 {
            return fail("budget.max_driver_steps must be at least 1");
        }
        Ok(())
    }
}

/// `[build]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Total in-flight generation calls
    pub max_parallelism: usize,
    /// Concurrent agents per component
    pub agents_per_component: usize,
    /// Candidates per component; 1 disables tournaments
    pub tournament_candidates: usize,
    /// Per-call generation timeout
    pub generation_timeout_ms: u64,
    /// Run the swarm in advisory mode during PARALLEL_BUILD
    pub continuous_verification: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            agents_per_component: 1,
            tournament_candidates: 1,
            generation_timeout_ms: 120_000,
            continuous_verification: false,
        }
    }
}

impl BuildConfig {
    /// Generation timeout as a duration
    #[must_use]
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }
}

/// `[swarm]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Per-checker timeout; expiry is a crash, never a pass
    pub checker_timeout_ms: u64,
    /// Score thresholds
    pub thresholds: Thresholds,
    /// Optional command the correctness checker runs in the merged sandbox
    pub correctness_command: Option<String>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            checker_timeout_ms: 60_000,
            thresholds: Thresholds::default(),
            correctness_command: None,
        }
    }
}

impl SwarmConfig {
    /// Checker timeout as a duration
    #[must_use]
    pub fn checker_timeout(&self) -> Duration {
        Duration::from_millis(self.checker_timeout_ms)
    }
}

/// Minimum passing scores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Structural quality
    pub structural_quality: f64,
    /// Visual/design
    pub visual_design: f64,
    /// Style/consistency
    pub style_consistency: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            structural_quality: 80.0,
            visual_design: 85.0,
            style_consistency: 85.0,
        }
    }
}

/// `[escalation]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Level 1 attempts
    pub local_fix_attempts: u32,
    /// Level 2 attempts
    pub component_fix_attempts: u32,
    /// Level 3 attempts
    pub component_rewrite_attempts: u32,
    /// Level 4 attempts; failure is terminal for the ladder
    pub feature_rewrite_attempts: u32,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            local_fix_attempts: 3,
            component_fix_attempts: 3,
            component_rewrite_attempts: 2,
            feature_rewrite_attempts: 1,
        }
    }
}

impl EscalationConfig {
    /// Attempt budget for `level`; level 0 is always a single templated fix
    #[must_use]
    pub fn budget(&self, level: EscalationLevel) -> u32 {
        match level {
            EscalationLevel::KnownPattern => 1,
            EscalationLevel::LocalFix => self.local_fix_attempts,
            EscalationLevel::ComponentFix => self.component_fix_attempts,
            EscalationLevel::ComponentRewrite => self.component_rewrite_attempts,
            EscalationLevel::FeatureRewrite => self.feature_rewrite_attempts,
        }
    }
}

/// `[budget]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Wall-clock limit for one session
    pub max_session_secs: Option<u64>,
    /// Cumulative generation cost limit
    pub max_cost_usd: Option<f64>,
    /// Generation call limit
    pub max_generation_calls: Option<u64>,
    /// Satisfaction gate rounds before aborting
    pub max_satisfaction_rounds: u32,
    /// Driver loop iterations before aborting
    pub max_driver_steps: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_session_secs: Some(4 * 60 * 60),
            max_cost_usd: None,
            max_generation_calls: None,
            max_satisfaction_rounds: 10,
            max_driver_steps: 500,
        }
    }
}

/// `[contract]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractConfig {
    /// Drafts above this ambiguity are rejected
    pub ambiguity_threshold: f64,
}

impl Default for ContractConfig {
    fn default() -> Self {
        Self {
            ambiguity_threshold: 0.3,
        }
    }
}

/// `[phases]`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    /// Commands run by FUNCTIONAL_TEST in the merged sandbox
    pub functional_commands: Vec<String>,
    /// Command run by DEMO, if any
    pub demo_command: Option<String>,
    /// Run DEPLOY (needs a deploy target)
    pub deploy_enabled: bool,
    /// Secrets fetched from the credential store at INIT
    pub required_secrets: Vec<String>,
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
