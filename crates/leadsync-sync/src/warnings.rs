//! Escalating workload warnings for salespeople carrying too many active
//! leads.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use leadsync_core::SalespersonWorkload;
use leadsync_storage::SalespersonStore;
use serde::Serialize;
use tracing::{debug, info};

/// Active-lead count at which a salesperson starts receiving warnings.
pub const ACTIVE_LEAD_THRESHOLD: i64 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkloadAction {
    None,
    FirstWarning,
    /// Sent to the salesperson; the manager is alerted as well.
    FinalWarning,
    Congratulate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkloadDecision {
    pub previous_count: i32,
    pub new_count: i32,
    pub action: WorkloadAction,
}

impl WorkloadDecision {
    pub fn counter_changed(&self) -> bool {
        self.previous_count != self.new_count
    }

    pub fn alerts_manager(&self) -> bool {
        self.action == WorkloadAction::FinalWarning
    }
}

pub fn evaluate_workload(warning_count: i32, active_leads: i64) -> WorkloadDecision {
    if active_leads >= ACTIVE_LEAD_THRESHOLD {
        let new_count = warning_count.max(0).saturating_add(1);
        let action = if new_count == 1 {
            WorkloadAction::FirstWarning
        } else {
            WorkloadAction::FinalWarning
        };
        return WorkloadDecision {
            previous_count: warning_count,
            new_count,
            action,
        };
    }

    WorkloadDecision {
        previous_count: warning_count,
        new_count: 0,
        action: if warning_count != 0 {
            WorkloadAction::Congratulate
        } else {
            WorkloadAction::None
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub chat_id: String,
    pub display_name: String,
}

/// Message delivery boundary.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipient: &Recipient, text: &str) -> Result<()>;
}

/// Writes messages to the log instead of delivering them.
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, recipient: &Recipient, text: &str) -> Result<()> {
        info!(chat_id = %recipient.chat_id, to = %recipient.display_name, "{text}");
        Ok(())
    }
}

pub fn first_warning_text(workload: &SalespersonWorkload) -> String {
    format!(
        "Hi {}, you currently have {} active leads (In Progress or Released). \
         Please bring this below {ACTIVE_LEAD_THRESHOLD} by updating or closing leads. \
         This is your first warning.",
        workload.name, workload.active_leads
    )
}

pub fn final_warning_text(workload: &SalespersonWorkload) -> String {
    format!(
        "Hi {}, you still have {} active leads. This is your final warning; \
         your manager has been notified.",
        workload.name, workload.active_leads
    )
}

pub fn manager_alert_text(workload: &SalespersonWorkload) -> String {
    format!(
        "{}{} still has {} active leads after {} warnings.",
        workload.name,
        workload
            .branch_name
            .as_deref()
            .map(|b| format!(" ({b})"))
            .unwrap_or_default(),
        workload.active_leads,
        workload.warning_count.saturating_add(1)
    )
}

pub fn congratulation_text(workload: &SalespersonWorkload) -> String {
    format!(
        "Well done {}, you are down to {} active leads. Your warnings have been cleared.",
        workload.name, workload.active_leads
    )
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WarningSummary {
    pub salespeople_checked: usize,
    pub first_warnings: usize,
    pub final_warnings: usize,
    pub manager_alerts: usize,
    pub congratulations: usize,
    pub log_messages: Vec<String>,
    pub errors: Vec<String>,
}

impl WarningSummary {
    fn log(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!(target: "leadsync::warnings", "{message}");
        self.log_messages.push(message);
    }

    fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!(target: "leadsync::warnings", error = true, "{message}");
        self.errors.push(message);
    }
}

pub struct WarningService {
    store: Arc<dyn SalespersonStore>,
    notifier: Arc<dyn Notifier>,
    manager: Option<Recipient>,
}

impl WarningService {
    pub fn new(store: Arc<dyn SalespersonStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            notifier,
            manager: None,
        }
    }

    pub fn with_manager(mut self, manager: Option<Recipient>) -> Self {
        self.manager = manager;
        self
    }

    pub async fn run(&self) -> WarningSummary {
        let mut summary = WarningSummary::default();
        let workloads = match self.store.list_workloads().await {
            Ok(workloads) => workloads,
            Err(err) => {
                summary.error(format!("Error reading salesperson workloads: {err}"));
                return summary;
            }
        };
        summary.log(format!("Checking workloads for {} salespeople", workloads.len()));

        for workload in &workloads {
            summary.salespeople_checked += 1;
            self.process(workload, &mut summary).await;
        }
        summary
    }

    async fn process(&self, workload: &SalespersonWorkload, summary: &mut WarningSummary) {
        let decision = evaluate_workload(workload.warning_count, workload.active_leads);
        if decision.counter_changed() {
            if let Err(err) = self
                .store
                .set_warning_count(workload.id, decision.new_count)
                .await
            {
                // Unsaved counter: skip notifying so the next run retries cleanly.
                summary.error(format!(
                    "Error saving warning count for salesperson {}: {err}",
                    workload.id
                ));
                return;
            }
        }

        let text = match decision.action {
            WorkloadAction::None => return,
            WorkloadAction::FirstWarning => {
                summary.first_warnings += 1;
                first_warning_text(workload)
            }
            WorkloadAction::FinalWarning => {
                summary.final_warnings += 1;
                final_warning_text(workload)
            }
            WorkloadAction::Congratulate => {
                summary.congratulations += 1;
                congratulation_text(workload)
            }
        };
        summary.log(format!(
            "{} ({} active leads): {:?}, warning count {} -> {}",
            workload.name,
            workload.active_leads,
            decision.action,
            decision.previous_count,
            decision.new_count
        ));

        match workload.chat_id.as_deref().filter(|c| !c.trim().is_empty()) {
            Some(chat_id) => {
                let recipient = Recipient {
                    chat_id: chat_id.to_string(),
                    display_name: workload.name.clone(),
                };
                if let Err(err) = self.notifier.notify(&recipient, &text).await {
                    summary.error(format!("Error notifying {}: {err}", workload.name));
                }
            }
            None => summary.log(format!(
                "No chat id for {}; message not sent",
                workload.name
            )),
        }

        if decision.alerts_manager() {
            match &self.manager {
                Some(manager) => {
                    match self.notifier.notify(manager, &manager_alert_text(workload)).await {
                        Ok(()) => summary.manager_alerts += 1,
                        Err(err) => summary.error(format!(
                            "Error notifying manager about {}: {err}",
                            workload.name
                        )),
                    }
                }
                None => summary.log("No manager chat id configured; manager alert skipped"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadsync_storage::StoreError;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStaff {
        workloads: Mutex<Vec<SalespersonWorkload>>,
        fail_writes: bool,
    }

    #[async_trait]
    impl SalespersonStore for MemoryStaff {
        async fn list_workloads(&self) -> Result<Vec<SalespersonWorkload>, StoreError> {
            Ok(self.workloads.lock().unwrap().clone())
        }

        async fn set_warning_count(&self, salesperson_id: i64, count: i32) -> Result<(), StoreError> {
            if self.fail_writes {
                return Err(StoreError::SalespersonNotFound(salesperson_id));
            }
            let mut workloads = self.workloads.lock().unwrap();
            let w = workloads
                .iter_mut()
                .find(|w| w.id == salesperson_id)
                .ok_or(StoreError::SalespersonNotFound(salesperson_id))?;
            w.warning_count = count;
            Ok(())
        }
    }

    impl MemoryStaff {
        fn with(workloads: Vec<SalespersonWorkload>) -> Self {
            Self {
                workloads: Mutex::new(workloads),
                fail_writes: false,
            }
        }

        fn set_active(&self, id: i64, active: i64) {
            let mut workloads = self.workloads.lock().unwrap();
            if let Some(w) = workloads.iter_mut().find(|w| w.id == id) {
                w.active_leads = active;
            }
        }

        fn count_for(&self, id: i64) -> i32 {
            self.workloads
                .lock()
                .unwrap()
                .iter()
                .find(|w| w.id == id)
                .map(|w| w.warning_count)
                .unwrap_or(-1)
        }
    }

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<HashMap<String, Vec<String>>>,
    }

    #[async_trait]
    impl Notifier for Outbox {
        async fn notify(&self, recipient: &Recipient, text: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .entry(recipient.chat_id.clone())
                .or_default()
                .push(text.to_string());
            Ok(())
        }
    }

    impl Outbox {
        fn count(&self, chat_id: &str) -> usize {
            self.sent.lock().unwrap().get(chat_id).map_or(0, Vec::len)
        }
    }

    fn person(id: i64, chat: Option<&str>, active: i64) -> SalespersonWorkload {
        SalespersonWorkload {
            id,
            name: format!("Rep {id}"),
            chat_id: chat.map(str::to_string),
            branch_name: Some("San Diego".into()),
            warning_count: 0,
            active_leads: active,
        }
    }

    fn manager() -> Recipient {
        Recipient {
            chat_id: "mgr".into(),
            display_name: "Manager".into(),
        }
    }

    #[test]
    fn threshold_is_inclusive() {
        assert_eq!(evaluate_workload(0, 11).action, WorkloadAction::None);
        let at = evaluate_workload(0, 12);
        assert_eq!(at.action, WorkloadAction::FirstWarning);
        assert_eq!(at.new_count, 1);
    }

    #[test]
    fn repeat_escalates_to_final() {
        let d = evaluate_workload(1, 15);
        assert_eq!((d.new_count, d.action), (2, WorkloadAction::FinalWarning));
        assert!(d.alerts_manager());
        let d = evaluate_workload(4, 30);
        assert_eq!((d.new_count, d.action), (5, WorkloadAction::FinalWarning));
    }

    #[test]
    fn dropping_below_resets_and_congratulates_once() {
        let d = evaluate_workload(2, 5);
        assert_eq!((d.new_count, d.action), (0, WorkloadAction::Congratulate));
        let d = evaluate_workload(0, 5);
        assert_eq!(d.action, WorkloadAction::None);
        assert!(!d.counter_changed());
    }

    #[tokio::test]
    async fn escalation_across_runs() {
        let store = Arc::new(MemoryStaff::with(vec![person(1, Some("c1"), 12)]));
        let outbox = Arc::new(Outbox::default());
        let service = WarningService::new(store.clone(), outbox.clone()).with_manager(Some(manager()));

        let first = service.run().await;
        assert_eq!(first.first_warnings, 1);
        assert_eq!(store.count_for(1), 1);
        assert_eq!(outbox.count("c1"), 1);
        assert_eq!(outbox.count("mgr"), 0);

        let second = service.run().await;
        assert_eq!(second.final_warnings, 1);
        assert_eq!(second.manager_alerts, 1);
        assert_eq!(store.count_for(1), 2);
        assert_eq!(outbox.count("mgr"), 1);

        store.set_active(1, 3);
        let third = service.run().await;
        assert_eq!(third.congratulations, 1);
        assert_eq!(store.count_for(1), 0);

        let fourth = service.run().await;
        assert_eq!(fourth.congratulations, 0);
        assert_eq!(outbox.count("c1"), 3);
    }

    #[tokio::test]
    async fn missing_chat_id_still_persists_counter() {
        let store = Arc::new(MemoryStaff::with(vec![person(7, None, 20)]));
        let outbox = Arc::new(Outbox::default());
        let summary = WarningService::new(store.clone(), outbox.clone()).run().await;

        assert_eq!(store.count_for(7), 1);
        assert_eq!(summary.first_warnings, 1);
        assert!(outbox.sent.lock().unwrap().is_empty());
        assert!(summary
            .log_messages
            .iter()
            .any(|m| m.contains("No chat id for Rep 7")));
    }

    #[tokio::test]
    async fn failed_counter_write_suppresses_message() {
        let store = Arc::new(MemoryStaff {
            workloads: Mutex::new(vec![person(3, Some("c3"), 14)]),
            fail_writes: true,
        });
        let outbox = Arc::new(Outbox::default());
        let summary = WarningService::new(store, outbox.clone()).run().await;

        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.first_warnings, 0);
        assert_eq!(outbox.count("c3"), 0);
    }
}
