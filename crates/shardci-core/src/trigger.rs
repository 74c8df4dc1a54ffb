//! Trigger events and run gating.
//!
//! The gate decides, per trigger event, whether the pipeline runs at
//! all, whether the run originates from a trusted repository (which
//! unlocks privileged side effects such as auto-committing fixes), and
//! whether the full suite or the sharded subset is selected.

use serde::{Deserialize, Serialize};

/// Kind of event that started a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Push,
    PullRequest,
    Manual,
}

/// A trigger event as delivered by the hosting platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerEvent {
    /// Event kind.
    pub kind: TriggerKind,

    /// Ref the event fired on (branch name for pushes, head ref for PRs).
    pub ref_name: String,

    /// Actor who caused the event.
    pub actor: String,

    /// Target branch (pull requests only).
    pub target_branch: Option<String>,

    /// Head repository identity (pull requests only).
    pub head_repo: Option<String>,
}

impl TriggerEvent {
    /// A push event on `ref_name`.
    pub fn push(ref_name: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            kind: TriggerKind::Push,
            ref_name: ref_name.into(),
            actor: actor.into(),
            target_branch: None,
            head_repo: None,
        }
    }

    /// A pull request event from `head_repo` targeting `target_branch`.
    pub fn pull_request(
        ref_name: impl Into<String>,
        actor: impl Into<String>,
        target_branch: impl Into<String>,
        head_repo: impl Into<String>,
    ) -> Self {
        Self {
            kind: TriggerKind::PullRequest,
            ref_name: ref_name.into(),
            actor: actor.into(),
            target_branch: Some(target_branch.into()),
            head_repo: Some(head_repo.into()),
        }
    }

    /// A manual dispatch on `ref_name`.
    pub fn manual(ref_name: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            kind: TriggerKind::Manual,
            ref_name: ref_name.into(),
            actor: actor.into(),
            target_branch: None,
            head_repo: None,
        }
    }
}

/// Lifecycle of a workflow run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Triggered,
    Gated,
    Running,
    Succeeded,
    Failed,
}

impl RunState {
    /// Advance to the next state. Illegal transitions are programmer
    /// errors and leave the state unchanged.
    pub fn advance(self, next: RunState) -> RunState {
        let legal = matches!(
            (self, next),
            (RunState::Idle, RunState::Triggered)
                | (RunState::Triggered, RunState::Gated)
                | (RunState::Gated, RunState::Running)
                | (RunState::Running, RunState::Succeeded)
                | (RunState::Running, RunState::Failed)
                | (RunState::Gated, RunState::Failed)
        );
        debug_assert!(legal, "illegal run state transition {self:?} -> {next:?}");
        if legal {
            next
        } else {
            self
        }
    }

    /// Whether the run has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }
}

/// Reported outcome of a required job external to the tranche pipeline
/// (build, lint). The jobs themselves run elsewhere; only their
/// pass/fail reports feed the final run status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobOutcome {
    /// Job name as reported by the platform.
    pub name: String,

    /// Whether the job passed.
    pub passed: bool,
}

impl JobOutcome {
    pub fn new(name: impl Into<String>, passed: bool) -> Self {
        Self {
            name: name.into(),
            passed,
        }
    }
}

/// Which slice of the test corpus a run executes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TestScope {
    /// Single tranche covering the whole corpus.
    Full,
    /// Deterministic tranche partition.
    Sharded,
}

/// Allowlists and trust configuration for the run gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatePolicy {
    /// Branches on which push events run.
    pub push_branches: Vec<String>,

    /// Target branches for which pull request events run.
    pub pr_target_branches: Vec<String>,

    /// The canonical repository; PR heads from anywhere else are untrusted.
    pub canonical_repo: String,

    /// Ref that selects the full (unsharded) test scope.
    pub release_branch: String,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            push_branches: vec!["main".to_string(), "release".to_string()],
            pr_target_branches: vec!["main".to_string(), "release".to_string()],
            canonical_repo: "stevedores-org/shardci".to_string(),
            release_branch: "release".to_string(),
        }
    }
}

/// Outcome of gate evaluation for one trigger event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateDecision {
    /// Whether the pipeline runs at all.
    pub proceed: bool,

    /// Whether privileged side effects (auto-fix commits, elevated
    /// credentials) are permitted.
    pub trusted: bool,

    /// Full or sharded test selection.
    pub test_scope: TestScope,

    /// Human-readable explanation.
    pub reason: String,
}

impl GatePolicy {
    /// Evaluate a trigger event against this policy.
    ///
    /// Gate rules:
    /// - push events run only on allowlisted branches
    /// - pull request events run only against allowlisted target branches
    /// - manual dispatches always run
    /// - a PR is trusted only when its head repository equals the
    ///   canonical repository; pushes and manual dispatches are trusted
    ///   by definition (they already required write access)
    /// - the release branch runs the full suite, everything else shards
    pub fn evaluate(&self, event: &TriggerEvent) -> GateDecision {
        let (proceed, reason) = match event.kind {
            TriggerKind::Push => {
                if self.push_branches.iter().any(|b| b == &event.ref_name) {
                    (true, format!("push to allowlisted branch '{}'", event.ref_name))
                } else {
                    (false, format!("push branch '{}' not allowlisted", event.ref_name))
                }
            }
            TriggerKind::PullRequest => match &event.target_branch {
                Some(target) if self.pr_target_branches.iter().any(|b| b == target) => {
                    (true, format!("pull request targeting '{target}'"))
                }
                Some(target) => (false, format!("PR target '{target}' not allowlisted")),
                None => (false, "pull request without target branch".to_string()),
            },
            TriggerKind::Manual => (true, "manual dispatch".to_string()),
        };

        let trusted = match event.kind {
            TriggerKind::PullRequest => event
                .head_repo
                .as_deref()
                .map(|repo| repo == self.canonical_repo)
                .unwrap_or(false),
            TriggerKind::Push | TriggerKind::Manual => true,
        };

        let test_scope = if event.ref_name == self.release_branch {
            TestScope::Full
        } else {
            TestScope::Sharded
        };

        GateDecision {
            proceed,
            trusted,
            test_scope,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_to_allowlisted_branch_proceeds() {
        let policy = GatePolicy::default();
        let decision = policy.evaluate(&TriggerEvent::push("main", "alice"));
        assert!(decision.proceed);
        assert!(decision.trusted);
        assert_eq!(decision.test_scope, TestScope::Sharded);
    }

    #[test]
    fn test_push_to_feature_branch_is_gated_out() {
        let policy = GatePolicy::default();
        let decision = policy.evaluate(&TriggerEvent::push("feature/wip", "alice"));
        assert!(!decision.proceed);
        assert!(decision.reason.contains("not allowlisted"));
    }

    #[test]
    fn test_pr_from_fork_is_untrusted() {
        let policy = GatePolicy::default();
        let event =
            TriggerEvent::pull_request("fix-thing", "bob", "main", "bob/shardci-fork");
        let decision = policy.evaluate(&event);
        assert!(decision.proceed, "fork PRs still run");
        assert!(!decision.trusted, "but without privileged side effects");
    }

    #[test]
    fn test_pr_from_canonical_repo_is_trusted() {
        let policy = GatePolicy::default();
        let event =
            TriggerEvent::pull_request("fix-thing", "carol", "main", "stevedores-org/shardci");
        let decision = policy.evaluate(&event);
        assert!(decision.proceed);
        assert!(decision.trusted);
    }

    #[test]
    fn test_pr_to_unlisted_target_is_gated_out() {
        let policy = GatePolicy::default();
        let event = TriggerEvent::pull_request("x", "dave", "experimental", "stevedores-org/shardci");
        assert!(!policy.evaluate(&event).proceed);
    }

    #[test]
    fn test_release_branch_selects_full_scope() {
        let policy = GatePolicy::default();
        let decision = policy.evaluate(&TriggerEvent::push("release", "alice"));
        assert!(decision.proceed);
        assert_eq!(decision.test_scope, TestScope::Full);
    }

    #[test]
    fn test_manual_dispatch_always_runs() {
        let policy = GatePolicy::default();
        let decision = policy.evaluate(&TriggerEvent::manual("anything", "ops"));
        assert!(decision.proceed);
        assert!(decision.trusted);
    }

    #[test]
    fn test_run_state_happy_path() {
        let state = RunState::Idle
            .advance(RunState::Triggered)
            .advance(RunState::Gated)
            .advance(RunState::Running)
            .advance(RunState::Succeeded);
        assert_eq!(state, RunState::Succeeded);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_run_state_failure_from_running() {
        let state = RunState::Running.advance(RunState::Failed);
        assert_eq!(state, RunState::Failed);
        assert!(state.is_terminal());
    }
}
