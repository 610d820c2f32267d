//! Alert rule evaluation and lifecycle management.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::alerting::condition::{EvalContext, Expr};
use crate::alerting::notify::{
    ChatWebhookChannel, EmailChannel, LoggingEmailTransport, NotificationChannel, PagingChannel,
    SmsChannel, WebhookChannel,
};
use crate::alerting::{default_rules, Alert, AlertRule, AlertSeverity, AlertStatus};
use crate::config::Config;
use crate::errors::ServiceError;
use crate::health::HealthRegistry;
use crate::metrics::{Counter, MetricsRegistry};
use crate::utils::time::unix_secs_f64;

struct CompiledRule {
    rule: AlertRule,
    expr: Expr,
}

/// Evaluates rules on a cadence, manages alert state, and fans out
/// notifications.
pub struct AlertEngine {
    service: String,
    rules: RwLock<HashMap<String, CompiledRule>>,
    active: RwLock<HashMap<String, Alert>>,
    history: Mutex<VecDeque<Alert>>,
    pending_since: Mutex<HashMap<String, f64>>,
    last_evaluated: Mutex<HashMap<String, f64>>,
    channels: RwLock<Vec<Arc<dyn NotificationChannel>>>,
    metrics: Arc<MetricsRegistry>,
    health: Arc<HealthRegistry>,
    eval_errors: Counter,
    notify_failures: Counter,
    alerts_fired: Counter,
    evaluation_interval: Duration,
    history_limit: usize,
}

impl AlertEngine {
    pub fn new(
        service: &str,
        metrics: Arc<MetricsRegistry>,
        health: Arc<HealthRegistry>,
    ) -> Self {
        metrics.describe(
            "alert_eval_errors_total",
            "Alert conditions that failed to evaluate",
        );
        metrics.describe("alerts_fired_total", "Alerts created");
        metrics.describe(
            "alert_notification_failures_total",
            "Notification deliveries that failed",
        );
        let eval_errors = metrics.counter("alert_eval_errors_total", &[]);
        let alerts_fired = metrics.counter("alerts_fired_total", &[]);
        let notify_failures = metrics.counter("alert_notification_failures_total", &[]);
        Self {
            service: service.to_string(),
            rules: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            pending_since: Mutex::new(HashMap::new()),
            last_evaluated: Mutex::new(HashMap::new()),
            channels: RwLock::new(Vec::new()),
            metrics,
            health,
            eval_errors,
            notify_failures,
            alerts_fired,
            evaluation_interval: Duration::from_secs(30),
            history_limit: 1000,
        }
    }

    /// Build from configuration: loop cadence, history bound, channels,
    /// and the default rule set.
    pub fn from_config(
        config: &Config,
        metrics: Arc<MetricsRegistry>,
        health: Arc<HealthRegistry>,
    ) -> Self {
        let service = config.service.name.clone();
        let mut engine = Self::new(&service, metrics, health);
        engine.evaluation_interval =
            Duration::from_secs(config.alerting.evaluation_interval_secs.max(1));
        engine.history_limit = config.alerting.history_limit.max(1);

        let channels = &config.alerting.channels;
        if let Some(email) = &channels.email {
            engine.add_channel(Arc::new(EmailChannel::new(
                email.clone(),
                Arc::new(LoggingEmailTransport),
            )));
        }
        if let Some(chat) = &channels.chat {
            engine.add_channel(Arc::new(ChatWebhookChannel::new(chat.clone(), &service)));
        }
        if let Some(webhook) = &channels.webhook {
            engine.add_channel(Arc::new(WebhookChannel::new(webhook.clone(), &service)));
        }
        if let Some(paging) = &channels.paging {
            engine.add_channel(Arc::new(PagingChannel::new(paging.clone(), &service)));
        }
        if let Some(sms) = &channels.sms {
            engine.add_channel(Arc::new(SmsChannel::new(sms.clone())));
        }

        if config.alerting.default_rules {
            for rule in default_rules(&service) {
                let name = rule.name.clone();
                if let Err(err) = engine.add_rule(rule) {
                    error!(rule = %name, error = %err, "default alert rule failed to compile");
                }
            }
        }

        engine
    }

    #[cfg(test)]
    fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn add_channel(&self, channel: Arc<dyn NotificationChannel>) {
        info!(channel = channel.name(), "notification channel registered");
        self.channels.write().push(channel);
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels
            .read()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    pub fn rule_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rules.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Add or replace a rule. The condition is compiled here, so bad
    /// expressions are rejected before they can reach the loop.
    pub fn add_rule(&self, rule: AlertRule) -> Result<(), ServiceError> {
        let expr = Expr::parse(&rule.condition)?;
        info!(rule = %rule.name, condition = %rule.condition, "alert rule added");
        self.rules
            .write()
            .insert(rule.name.clone(), CompiledRule { rule, expr });
        Ok(())
    }

    /// Remove a rule and resolve any alert it has open.
    pub fn remove_rule(&self, name: &str) {
        if self.rules.write().remove(name).is_none() {
            return;
        }
        let now = unix_secs_f64();
        let resolved: Vec<Alert> = {
            let mut active = self.active.write();
            let ids: Vec<String> = active
                .values()
                .filter(|a| a.rule_name == name)
                .map(|a| a.id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| active.remove(&id))
                .map(|mut alert| {
                    alert.status = AlertStatus::Resolved;
                    alert.resolved_at = Some(now);
                    alert
                })
                .collect()
        };
        for alert in resolved {
            self.push_history(alert);
        }
        self.pending_since.lock().remove(name);
        info!(rule = %name, "alert rule removed");
    }

    pub fn rule(&self, name: &str) -> Option<AlertRule> {
        self.rules.read().get(name).map(|c| c.rule.clone())
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        self.rules.read().values().map(|c| c.rule.clone()).collect()
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.active.read().values().cloned().collect();
        alerts.sort_by(|a, b| {
            a.started_at
                .partial_cmp(&b.started_at)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        alerts
    }

    /// Most recent resolved alerts, oldest first.
    pub fn history(&self, limit: usize) -> Vec<Alert> {
        let history = self.history.lock();
        let take = limit.min(history.len());
        history.iter().skip(history.len() - take).cloned().collect()
    }

    pub fn acknowledge(&self, alert_id: &str, acknowledged_by: &str) -> bool {
        let mut active = self.active.write();
        match active.get_mut(alert_id) {
            Some(alert) => {
                alert.status = AlertStatus::Acknowledged;
                alert.acknowledged_at = Some(unix_secs_f64());
                alert.acknowledged_by = Some(acknowledged_by.to_string());
                info!(rule = %alert.rule_name, by = acknowledged_by, "alert acknowledged");
                true
            }
            None => false,
        }
    }

    /// Manually resolve an alert. No resolution notice is sent.
    pub fn resolve(&self, alert_id: &str) -> bool {
        let alert = {
            let mut active = self.active.write();
            match active.remove(alert_id) {
                Some(mut alert) => {
                    alert.status = AlertStatus::Resolved;
                    alert.resolved_at = Some(unix_secs_f64());
                    alert
                }
                None => return false,
            }
        };
        info!(rule = %alert.rule_name, "alert manually resolved");
        self.push_history(alert);
        true
    }

    /// Fire an ad-hoc alert outside the rule set. Deduplicates by name
    /// and fans out to every registered channel.
    pub async fn emit(
        &self,
        name: &str,
        severity: AlertSeverity,
        message: &str,
        labels: HashMap<String, String>,
    ) -> String {
        if let Some(existing) = self
            .active
            .read()
            .values()
            .find(|a| a.rule_name == name)
            .map(|a| a.id.clone())
        {
            debug!(rule = %name, "alert already active, emit deduplicated");
            return existing;
        }

        let now = unix_secs_f64();
        let mut alert = Alert {
            id: format!("{}_{}", name, (now * 1000.0) as u64),
            rule_name: name.to_string(),
            severity,
            status: AlertStatus::Active,
            message: message.to_string(),
            started_at: now,
            resolved_at: None,
            acknowledged_at: None,
            acknowledged_by: None,
            labels,
            annotations: HashMap::new(),
            notification_count: 0,
            last_notification_at: None,
        };
        self.alerts_fired.increment();
        warn!(
            rule = %name,
            severity = severity.as_str(),
            message = %message,
            "alert emitted"
        );
        self.dispatch(&alert, &[]).await;
        alert.notification_count = 1;
        alert.last_notification_at = Some(now);
        let id = alert.id.clone();
        self.active.write().insert(id.clone(), alert);
        id
    }

    /// Run one evaluation round against current state.
    pub async fn evaluate_all(&self) {
        self.evaluate_all_at(unix_secs_f64()).await;
    }

    /// Evaluation round with an explicit timestamp, used by the loop
    /// and by deterministic tests.
    pub async fn evaluate_all_at(&self, now: f64) {
        let snapshot = self.health.check_all(true).await;
        let ctx = EvalContext {
            metrics: &self.metrics,
            health: snapshot.statuses(),
            overall_health: snapshot.overall_status,
            now,
        };

        let rules: Vec<(AlertRule, Expr)> = self
            .rules
            .read()
            .values()
            .filter(|c| c.rule.enabled)
            .map(|c| (c.rule.clone(), c.expr.clone()))
            .collect();

        for (rule, expr) in rules {
            {
                let mut last = self.last_evaluated.lock();
                if let Some(at) = last.get(&rule.name) {
                    if now - at < rule.evaluation_interval.as_secs_f64() {
                        continue;
                    }
                }
                last.insert(rule.name.clone(), now);
            }

            let condition_met = match expr.evaluate(&ctx) {
                Ok(met) => met,
                Err(err) => {
                    warn!(rule = %rule.name, error = %err, "alert condition failed to evaluate");
                    self.eval_errors.increment();
                    false
                }
            };

            self.apply_rule_state(&rule, condition_met, now).await;
        }
    }

    async fn apply_rule_state(&self, rule: &AlertRule, condition_met: bool, now: f64) {
        let existing: Option<Alert> = self
            .active
            .read()
            .values()
            .find(|a| a.rule_name == rule.name)
            .cloned();

        if condition_met {
            match existing {
                None => {
                    let held_since = {
                        let mut pending = self.pending_since.lock();
                        *pending.entry(rule.name.clone()).or_insert(now)
                    };
                    if now - held_since >= rule.for_duration.as_secs_f64() {
                        self.pending_since.lock().remove(&rule.name);
                        self.fire(rule, now).await;
                    } else {
                        debug!(
                            rule = %rule.name,
                            held_secs = now - held_since,
                            "alert condition pending"
                        );
                    }
                }
                Some(mut alert) => {
                    if alert.status == AlertStatus::Acknowledged {
                        return;
                    }
                    let repeat = alert.severity.repeat_interval().as_secs_f64();
                    let due = alert
                        .last_notification_at
                        .map(|at| now - at >= repeat)
                        .unwrap_or(true);
                    if due {
                        self.dispatch(&alert, &rule.channels).await;
                        alert.notification_count += 1;
                        alert.last_notification_at = Some(now);
                        self.active.write().insert(alert.id.clone(), alert);
                    }
                }
            }
        } else {
            self.pending_since.lock().remove(&rule.name);
            if let Some(mut alert) = existing {
                alert.status = AlertStatus::Resolved;
                alert.resolved_at = Some(now);
                self.active.write().remove(&alert.id);
                self.push_history(alert.clone());
                info!(rule = %rule.name, "alert resolved");
                self.dispatch(&alert, &rule.channels).await;
            }
        }
    }

    async fn fire(&self, rule: &AlertRule, now: f64) {
        let message = rule
            .annotations
            .get("summary")
            .cloned()
            .unwrap_or_else(|| format!("alert condition met for {}", rule.name));
        let mut alert = Alert {
            id: format!("{}_{}", rule.name, (now * 1000.0) as u64),
            rule_name: rule.name.clone(),
            severity: rule.severity,
            status: AlertStatus::Active,
            message,
            started_at: now,
            resolved_at: None,
            acknowledged_at: None,
            acknowledged_by: None,
            labels: rule.labels.clone(),
            annotations: rule.annotations.clone(),
            notification_count: 0,
            last_notification_at: None,
        };
        self.alerts_fired.increment();
        warn!(
            rule = %rule.name,
            alert_id = %alert.id,
            severity = rule.severity.as_str(),
            message = %alert.message,
            "alert created"
        );
        self.dispatch(&alert, &rule.channels).await;
        alert.notification_count = 1;
        alert.last_notification_at = Some(now);
        self.active.write().insert(alert.id.clone(), alert);
    }

    /// Send to the named channels concurrently, or to every registered
    /// channel when the list is empty. Failures are logged and counted.
    async fn dispatch(&self, alert: &Alert, channel_names: &[String]) {
        let registered: Vec<Arc<dyn NotificationChannel>> = self.channels.read().clone();
        let selected: Vec<Arc<dyn NotificationChannel>> = if channel_names.is_empty() {
            registered
        } else {
            let mut selected = Vec::new();
            for name in channel_names {
                match registered.iter().find(|c| c.name() == name) {
                    Some(channel) => selected.push(channel.clone()),
                    None => {
                        warn!(channel = %name, "notification channel not registered")
                    }
                }
            }
            selected
        };

        let handles: Vec<_> = selected
            .into_iter()
            .map(|channel| {
                let alert = alert.clone();
                tokio::spawn(async move {
                    let result = channel.deliver(&alert).await;
                    (channel.name().to_string(), result)
                })
            })
            .collect();

        for handle in handles {
            match handle.await {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(err))) => {
                    error!(channel = %name, error = %err, "notification delivery failed");
                    self.notify_failures.increment();
                }
                Err(err) => {
                    error!(error = %err, "notification task failed");
                    self.notify_failures.increment();
                }
            }
        }
    }

    fn push_history(&self, alert: Alert) {
        let mut history = self.history.lock();
        history.push_back(alert);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    /// Background evaluation loop. Runs until the stop signal flips.
    pub fn spawn_evaluation_loop(
        self: &Arc<Self>,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        info!(
            interval_secs = engine.evaluation_interval.as_secs(),
            rules = engine.rules.read().len(),
            "alert evaluation loop started"
        );
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(engine.evaluation_interval) => {
                        engine.evaluate_all().await;
                    }
                    _ = stop.changed() => {
                        debug!("alert evaluation loop stopping");
                        break;
                    }
                }
            }
        })
    }
}
