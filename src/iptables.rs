//! iptables rules that keep the kernel out of the tunnel
//!
//! The raw fabric works only if the kernel neither tracks the crafted flows
//! nor answers them. Three rules arrange that, applied for both `iptables`
//! and `ip6tables`:
//!
//! ```text
//! raw    PREROUTING -p tcp --dport PORT -j NOTRACK
//! raw    OUTPUT     -p tcp --sport PORT -j NOTRACK
//! mangle OUTPUT     -p tcp --sport PORT --tcp-flags RST RST -j DROP
//! ```
//!
//! Without NOTRACK, conntrack classifies the stateless segments as INVALID;
//! without the RST drop, the kernel answers every captured PSH+ACK with a
//! reset that tears down state on middleboxes.
//!
//! Every successfully applied rule is recorded in order; `cleanup()`
//! deletes exactly that set, so a partial `apply()` rolls back only what it
//! actually did. Command execution goes through a small trait so tests can
//! fault-inject.

use std::process::Command;

use tracing::{debug, info, warn};

use crate::error::IptablesError;

/// Executes an iptables binary; swapped out in tests
pub trait CommandRunner: Send + Sync {
    /// Run `binary` with `args`, treating non-zero exit as an error.
    ///
    /// # Errors
    ///
    /// A human-readable reason (exit status plus captured output).
    fn run(&self, binary: &'static str, args: &[String]) -> Result<(), String>;
}

/// Runs the real binaries from `PATH`
#[derive(Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, binary: &'static str, args: &[String]) -> Result<(), String> {
        let output = Command::new(binary)
            .args(args)
            .output()
            .map_err(|e| format!("{binary} not runnable: {e}"))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    table: &'static str,
    chain: &'static str,
    args: Vec<String>,
}

#[derive(Debug)]
struct AppliedRule {
    binary: &'static str,
    rule: Rule,
}

/// Applies and reverses the NOTRACK/RST-drop rule set for one port
pub struct IptablesManager {
    port: u16,
    applied: Vec<AppliedRule>,
    runner: Box<dyn CommandRunner>,
}

impl IptablesManager {
    /// Manager for `port` using the real iptables binaries
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self::with_runner(port, Box::new(SystemRunner))
    }

    /// Manager with a custom command runner (tests)
    #[must_use]
    pub fn with_runner(port: u16, runner: Box<dyn CommandRunner>) -> Self {
        Self {
            port,
            applied: Vec::new(),
            runner,
        }
    }

    /// Apply all rules in order. On the first failure, already-applied
    /// rules stay recorded for `cleanup()` and the error is returned.
    ///
    /// # Errors
    ///
    /// `UnsupportedPlatform` off Linux, `InvalidPort` for port 0,
    /// `RuleFailed` when a rule is rejected.
    pub fn apply(&mut self) -> Result<(), IptablesError> {
        if !cfg!(target_os = "linux") {
            return Err(IptablesError::UnsupportedPlatform {
                os: std::env::consts::OS,
            });
        }
        if self.port == 0 {
            return Err(IptablesError::InvalidPort {
                port: u32::from(self.port),
            });
        }

        for rule in self.rules() {
            for binary in ["iptables", "ip6tables"] {
                let mut args = vec![
                    "-t".to_string(),
                    rule.table.to_string(),
                    "-A".to_string(),
                    rule.chain.to_string(),
                ];
                args.extend(rule.args.iter().cloned());

                self.runner.run(binary, &args).map_err(|reason| {
                    IptablesError::RuleFailed {
                        binary,
                        table: rule.table,
                        chain: rule.chain,
                        reason,
                    }
                })?;
                debug!(binary, table = rule.table, chain = rule.chain, "applied rule");
                self.applied.push(AppliedRule {
                    binary,
                    rule: rule.clone(),
                });
            }
        }

        info!(port = self.port, "iptables rules applied");
        Ok(())
    }

    /// Remove every rule `apply()` managed to add. Failures are logged,
    /// never propagated, so cleanup always finishes.
    pub fn cleanup(&mut self) {
        let had_rules = !self.applied.is_empty();
        for applied in self.applied.drain(..) {
            let mut args = vec![
                "-t".to_string(),
                applied.rule.table.to_string(),
                "-D".to_string(),
                applied.rule.chain.to_string(),
            ];
            args.extend(applied.rule.args.iter().cloned());

            match self.runner.run(applied.binary, &args) {
                Ok(()) => debug!(
                    binary = applied.binary,
                    table = applied.rule.table,
                    chain = applied.rule.chain,
                    "removed rule"
                ),
                Err(reason) => warn!(
                    binary = applied.binary,
                    table = applied.rule.table,
                    chain = applied.rule.chain,
                    %reason,
                    "failed to remove rule"
                ),
            }
        }
        if had_rules {
            info!(port = self.port, "iptables rules cleaned up");
        }
    }

    /// Number of rules currently recorded as applied
    #[must_use]
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    fn rules(&self) -> Vec<Rule> {
        let port = self.port.to_string();
        vec![
            Rule {
                table: "raw",
                chain: "PREROUTING",
                args: str_args(&["-p", "tcp", "--dport", &port, "-j", "NOTRACK"]),
            },
            Rule {
                table: "raw",
                chain: "OUTPUT",
                args: str_args(&["-p", "tcp", "--sport", &port, "-j", "NOTRACK"]),
            },
            Rule {
                table: "mangle",
                chain: "OUTPUT",
                args: str_args(&[
                    "-p",
                    "tcp",
                    "--sport",
                    &port,
                    "--tcp-flags",
                    "RST",
                    "RST",
                    "-j",
                    "DROP",
                ]),
            },
        ]
    }
}

impl Drop for IptablesManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for IptablesManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IptablesManager")
            .field("port", &self.port)
            .field("applied", &self.applied.len())
            .finish()
    }
}

fn str_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    struct Invocation {
        binary: &'static str,
        args: Vec<String>,
    }

    /// Records invocations; fails the nth one (1-based) when set.
    struct FakeRunner {
        calls: Arc<Mutex<Vec<Invocation>>>,
        fail_at: Option<usize>,
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, binary: &'static str, args: &[String]) -> Result<(), String> {
            let mut calls = self.calls.lock();
            calls.push(Invocation {
                binary,
                args: args.to_vec(),
            });
            if self.fail_at == Some(calls.len()) {
                return Err("synthetic failure".into());
            }
            Ok(())
        }
    }

    fn manager(port: u16, fail_at: Option<usize>) -> (IptablesManager, Arc<Mutex<Vec<Invocation>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let runner = FakeRunner {
            calls: Arc::clone(&calls),
            fail_at,
        };
        (IptablesManager::with_runner(port, Box::new(runner)), calls)
    }

    #[test]
    fn test_apply_issues_all_rules_for_both_binaries() {
        let (mut mgr, calls) = manager(443, None);
        mgr.apply().unwrap();

        let calls = calls.lock().clone();
        // 3 rules x 2 binaries
        assert_eq!(calls.len(), 6);
        assert_eq!(mgr.applied_count(), 6);
        assert!(calls.iter().all(|c| c.args.contains(&"-A".to_string())));
        assert_eq!(calls.iter().filter(|c| c.binary == "iptables").count(), 3);
        assert_eq!(calls.iter().filter(|c| c.binary == "ip6tables").count(), 3);
        assert!(calls[0].args.contains(&"NOTRACK".to_string()));
        assert!(calls[4].args.contains(&"RST".to_string()));
    }

    #[test]
    fn test_cleanup_reverses_exactly_what_was_applied() {
        let (mut mgr, calls) = manager(443, None);
        mgr.apply().unwrap();
        calls.lock().clear();

        mgr.cleanup();
        let calls = calls.lock().clone();
        assert_eq!(calls.len(), 6);
        assert!(calls.iter().all(|c| c.args.contains(&"-D".to_string())));
        assert_eq!(mgr.applied_count(), 0);
    }

    #[test]
    fn test_partial_failure_rolls_back_only_applied_rules() {
        // Rule 1 applies for both binaries (calls 1, 2); rule 2's iptables
        // invocation (call 3) fails. Rollback must remove exactly calls 1-2
        // and rule 3 must never have been attempted.
        let (mut mgr, calls) = manager(443, Some(3));
        let err = mgr.apply().unwrap_err();
        assert!(matches!(err, IptablesError::RuleFailed { .. }));
        assert_eq!(mgr.applied_count(), 2);

        let applied_calls = calls.lock().clone();
        assert!(applied_calls
            .iter()
            .all(|c| !c.args.contains(&"RST".to_string())), "rule 3 must never run");

        calls.lock().clear();
        mgr.cleanup();
        let cleanup_calls = calls.lock().clone();
        assert_eq!(cleanup_calls.len(), 2);
        assert!(cleanup_calls.iter().all(|c| c.args.contains(&"-D".to_string())));
        assert!(cleanup_calls.iter().all(|c| c.args.contains(&"--dport".to_string())));
    }

    #[test]
    fn test_cleanup_without_apply_is_a_noop() {
        let (mut mgr, calls) = manager(443, None);
        mgr.cleanup();
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn test_cleanup_failure_is_swallowed() {
        let (mut mgr, calls) = manager(443, Some(8));
        mgr.apply().unwrap();
        // Call 8 (second cleanup command) fails; cleanup must keep going.
        mgr.cleanup();
        assert_eq!(calls.lock().len(), 12);
        assert_eq!(mgr.applied_count(), 0);
    }

    #[test]
    fn test_port_zero_rejected() {
        let (mut mgr, calls) = manager(0, None);
        let err = mgr.apply().unwrap_err();
        assert!(matches!(err, IptablesError::InvalidPort { .. }));
        assert!(calls.lock().is_empty());
    }
}
