//! Rule-engine boundary.
//!
//! The evaluator hands each cycle's [`BindingContext`] and packet to a
//! [`RuleEngine`]. Real forward-chaining engines plug in behind that trait;
//! [`SequentialRuleEngine`] is the in-process reference engine: every
//! registered [`Rule`] is evaluated once per cycle, highest salience first.

use async_trait::async_trait;
use trackguard_kernel::BindingContext;
use trackguard_types::{IncomingPacket, TrackError};

/// A rule: condition plus action, evaluated against one cycle's bindings.
#[async_trait]
pub trait Rule: Send + Sync {
    fn name(&self) -> &str;

    /// Higher runs first. Default `0`.
    fn salience(&self) -> i32 {
        0
    }

    /// Test the condition and run the action when it holds.
    ///
    /// Returns whether the rule fired.
    async fn evaluate(&self, ctx: &BindingContext, packet: &mut IncomingPacket) -> Result<bool, TrackError>;
}

/// Executes rules for one evaluation cycle.
#[async_trait]
pub trait RuleEngine: Send + Sync {
    /// Names of the rules that fired, in firing order.
    async fn execute(&self, ctx: &BindingContext, packet: &mut IncomingPacket) -> Result<Vec<String>, TrackError>;
}

/// Runs each rule once, by descending salience; ties keep insertion order.
#[derive(Default)]
pub struct SequentialRuleEngine {
    rules: Vec<Box<dyn Rule>>,
}

impl SequentialRuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
        self.rules.sort_by_key(|r| std::cmp::Reverse(r.salience()));
    }

    pub fn with_rule(mut self, rule: Box<dyn Rule>) -> Self {
        self.add_rule(rule);
        self
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }
}

#[async_trait]
impl RuleEngine for SequentialRuleEngine {
    /// Stops at the first rule error.
    async fn execute(&self, ctx: &BindingContext, packet: &mut IncomingPacket) -> Result<Vec<String>, TrackError> {
        let mut fired = Vec::new();
        for rule in &self.rules {
            if rule.evaluate(ctx, packet).await? {
                fired.push(rule.name().to_string());
            }
        }
        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;
    use trackguard_kernel::CapabilityRegistry;

    struct Recorder {
        name: &'static str,
        salience: i32,
        fires: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Rule for Recorder {
        fn name(&self) -> &str {
            self.name
        }
        fn salience(&self) -> i32 {
            self.salience
        }
        async fn evaluate(&self, _ctx: &BindingContext, packet: &mut IncomingPacket) -> Result<bool, TrackError> {
            self.log.lock().map_err(|_| TrackError::Channel("poisoned".into()))?.push(self.name);
            if self.fires {
                packet.speed += 1;
            }
            Ok(self.fires)
        }
    }

    struct Broken;

    #[async_trait]
    impl Rule for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        async fn evaluate(&self, ctx: &BindingContext, _packet: &mut IncomingPacket) -> Result<bool, TrackError> {
            ctx.call_bool("nowhere", "anything", &[]).await
        }
    }

    fn packet() -> IncomingPacket {
        IncomingPacket {
            imei: "1".into(),
            speed: 0,
            gsm_signal_strength: 0,
            datetime: chrono::Utc::now(),
            positioning_status: "A".into(),
            position_valid: true,
            latitude: 0.0,
            longitude: 0.0,
            flags: Default::default(),
        }
    }

    #[tokio::test]
    async fn rules_run_by_salience_and_report_fired() -> Result<(), Box<dyn std::error::Error>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let rule = |name, salience, fires| -> Box<dyn Rule> {
            Box::new(Recorder {
                name,
                salience,
                fires,
                log: Arc::clone(&log),
            })
        };
        let engine = SequentialRuleEngine::new()
            .with_rule(rule("low", 1, true))
            .with_rule(rule("high", 100, true))
            .with_rule(rule("mid", 50, false));
        assert_eq!(engine.rule_names(), vec!["high", "mid", "low"]);

        let ctx = CapabilityRegistry::new().build_context("1").await;
        let mut p = packet();
        let fired = engine.execute(&ctx, &mut p).await?;

        assert_eq!(fired, vec!["high".to_string(), "low".to_string()]);
        assert_eq!(p.speed, 2);
        assert_eq!(*log.lock().map_err(|_| "poisoned")?, vec!["high", "mid", "low"]);
        Ok(())
    }

    #[tokio::test]
    async fn rule_error_aborts_cycle() {
        let engine = SequentialRuleEngine::new().with_rule(Box::new(Broken));
        let ctx = CapabilityRegistry::new().build_context("1").await;
        let err = engine.execute(&ctx, &mut packet()).await.unwrap_err();
        assert_eq!(err, TrackError::UnknownBinding("nowhere".into()));
    }
}
