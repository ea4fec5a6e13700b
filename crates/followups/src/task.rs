use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use dialback_core::{ApplicantId, CallRecordId, DomainError, DomainResult, LeadId, TaskId};

use crate::context;

/// Who a follow-up call is placed to.
///
/// A task points at exactly one CRM record: a lead or an applicant, never both.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum TargetRef {
    Lead(LeadId),
    Applicant(ApplicantId),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Lead,
    Applicant,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Lead => "lead",
            TargetKind::Applicant => "applicant",
        }
    }
}

impl FromStr for TargetKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lead" => Ok(TargetKind::Lead),
            "applicant" => Ok(TargetKind::Applicant),
            other => Err(DomainError::validation(format!(
                "target kind must be one of: lead, applicant (got '{other}')"
            ))),
        }
    }
}

impl TargetRef {
    pub fn new(kind: TargetKind, id: Uuid) -> Self {
        match kind {
            TargetKind::Lead => TargetRef::Lead(LeadId::from_uuid(id)),
            TargetKind::Applicant => TargetRef::Applicant(ApplicantId::from_uuid(id)),
        }
    }

    /// Rebuild a target from the two nullable storage columns.
    ///
    /// Exactly one column must be set.
    pub fn from_columns(lead_id: Option<Uuid>, applicant_id: Option<Uuid>) -> DomainResult<Self> {
        match (lead_id, applicant_id) {
            (Some(lead), None) => Ok(TargetRef::Lead(LeadId::from_uuid(lead))),
            (None, Some(applicant)) => Ok(TargetRef::Applicant(ApplicantId::from_uuid(applicant))),
            (Some(_), Some(_)) => Err(DomainError::invariant(
                "task references both a lead and an applicant",
            )),
            (None, None) => Err(DomainError::invariant("task has no linked target")),
        }
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            TargetRef::Lead(_) => TargetKind::Lead,
            TargetRef::Applicant(_) => TargetKind::Applicant,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            TargetRef::Lead(id) => *id.as_uuid(),
            TargetRef::Applicant(id) => *id.as_uuid(),
        }
    }

    pub fn lead_id(&self) -> Option<LeadId> {
        match self {
            TargetRef::Lead(id) => Some(*id),
            TargetRef::Applicant(_) => None,
        }
    }

    pub fn applicant_id(&self) -> Option<ApplicantId> {
        match self {
            TargetRef::Lead(_) => None,
            TargetRef::Applicant(id) => Some(*id),
        }
    }
}

impl core::fmt::Display for TargetRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.kind().as_str(), self.id())
    }
}

/// Contact channel of a follow-up.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    VoiceCall,
    Phone,
    #[serde(rename = "whatsapp")]
    WhatsApp,
    Sms,
    Email,
}

impl Channel {
    /// Only callable channels are picked up by the dispatcher.
    pub fn is_callable(&self) -> bool {
        matches!(self, Channel::VoiceCall | Channel::Phone)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::VoiceCall => "voice_call",
            Channel::Phone => "phone",
            Channel::WhatsApp => "whatsapp",
            Channel::Sms => "sms",
            Channel::Email => "email",
        }
    }

    pub fn callable() -> [Channel; 2] {
        [Channel::VoiceCall, Channel::Phone]
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::VoiceCall
    }
}

impl FromStr for Channel {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "voice_call" | "ai_call" | "call" => Ok(Channel::VoiceCall),
            "phone" => Ok(Channel::Phone),
            "whatsapp" => Ok(Channel::WhatsApp),
            "sms" => Ok(Channel::Sms),
            "email" => Ok(Channel::Email),
            other => Err(DomainError::validation(format!("unknown channel '{other}'"))),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    /// Numeric rank used for ordering in storage (higher runs first).
    pub fn rank(&self) -> i16 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl FromStr for Priority {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" | "medium" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(DomainError::validation(format!("unknown priority '{other}'"))),
        }
    }
}

/// Follow-up task status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for `due_at`
    Pending,
    /// Picked up by the dispatcher and enqueued
    Scheduled,
    /// Claimed by exactly one worker
    InProgress,
    /// Dialer accepted the call
    Completed,
    /// Permanently failed (no retries left or permanent error)
    Failed,
    /// Cancelled before (or during) execution
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Statuses the dispatcher scans for.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Scheduled)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (*self, next),
            (Pending, Scheduled)
                | (Pending, InProgress)
                | (Pending, Cancelled)
                | (Scheduled, InProgress)
                | (Scheduled, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Pending)
                | (InProgress, Cancelled)
        )
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "scheduled" => Ok(TaskStatus::Scheduled),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown task status '{other}'"))),
        }
    }
}

/// `last_error` recorded when an abandoned claim is released.
pub const CLAIM_EXPIRED: &str = "claim expired before execution finished";

/// Result of checking whether a task may be claimed right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    /// Another worker already owns the task.
    InProgress,
    /// Terminal or otherwise not in a dispatchable status.
    NotDispatchable(TaskStatus),
    NotDue(DateTime<Utc>),
    NotCallable(Channel),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

/// A scheduled follow-up call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpTask {
    pub id: TaskId,
    pub target: TargetRef,
    pub channel: Channel,
    pub due_at: DateTime<Utc>,
    pub status: TaskStatus,
    /// Terminal flag kept alongside `status` for older queries.
    pub completed: bool,
    pub priority: Priority,
    pub notes: String,
    /// Opaque payload supplied by the context builder.
    pub context: Map<String, Value>,
    pub call_record_id: Option<CallRecordId>,
    /// Number of claims that reached the dialing stage.
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Set while `in_progress`; identifies the claim that owns the task.
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FollowUpTask {
    /// Create a new pending task.
    pub fn new(target: TargetRef, channel: Channel, due_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            target,
            channel,
            due_at,
            status: TaskStatus::Pending,
            completed: false,
            priority: Priority::Normal,
            notes: String::new(),
            context: Map::new(),
            call_record_id: None,
            attempts: 0,
            last_error: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    /// Reason marker handed to the dialer along with the context.
    pub fn reason(&self) -> &str {
        let notes = self.notes.trim();
        if notes.is_empty() { "follow_up" } else { notes }
    }

    pub fn is_terminal(&self) -> bool {
        self.completed || self.status.is_terminal()
    }

    pub fn eligibility(&self, now: DateTime<Utc>) -> Eligibility {
        if self.status == TaskStatus::InProgress {
            return Eligibility::InProgress;
        }
        if self.completed || !self.status.is_dispatchable() {
            return Eligibility::NotDispatchable(self.status);
        }
        if !self.channel.is_callable() {
            return Eligibility::NotCallable(self.channel);
        }
        if self.due_at > now {
            return Eligibility::NotDue(self.due_at);
        }
        Eligibility::Eligible
    }

    fn transition(&mut self, next: TaskStatus, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::transition(self.status, next));
        }
        self.status = next;
        self.claimed_at = (next == TaskStatus::InProgress).then_some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Dispatcher pickup: pending -> scheduled (already scheduled is a no-op).
    pub fn mark_scheduled(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status == TaskStatus::Scheduled {
            return Ok(());
        }
        self.transition(TaskStatus::Scheduled, now)
    }

    /// Claim: pending/scheduled -> in_progress.
    pub fn begin_execution(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(TaskStatus::InProgress, now)?;
        self.attempts += 1;
        Ok(())
    }

    pub fn complete(&mut self, call_record_id: CallRecordId, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(TaskStatus::Completed, now)?;
        self.completed = true;
        self.call_record_id = Some(call_record_id);
        self.last_error = None;
        Ok(())
    }

    /// Terminal failure; the error stays on the task for operator review.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(TaskStatus::Failed, now)?;
        self.completed = false;
        self.last_error = Some(error.into());
        Ok(())
    }

    /// Transient failure with retries left: back to pending, due at `retry_at`.
    pub fn schedule_retry(
        &mut self,
        error: impl Into<String>,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.transition(TaskStatus::Pending, now)?;
        self.due_at = retry_at;
        self.last_error = Some(error.into());
        Ok(())
    }

    /// Whether an `in_progress` claim was taken before `cutoff`.
    pub fn claim_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == TaskStatus::InProgress && self.claimed_at.unwrap_or(self.updated_at) < cutoff
    }

    /// Return an abandoned claim to pending so the next scan picks it up.
    pub fn release_expired_claim(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != TaskStatus::InProgress {
            return Err(DomainError::conflict(format!(
                "task {} is {} and holds no claim",
                self.id, self.status
            )));
        }
        self.transition(TaskStatus::Pending, now)?;
        self.last_error = Some(CLAIM_EXPIRED.to_string());
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.is_terminal() {
            return Err(DomainError::conflict(format!(
                "task {} is already {}",
                self.id, self.status
            )));
        }
        self.transition(TaskStatus::Cancelled, now)?;
        self.completed = true;
        Ok(())
    }

    /// Manual trigger: make a waiting task due immediately.
    pub fn pull_due_forward(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.is_dispatchable() || self.completed {
            return Err(DomainError::conflict(format!(
                "task {} is {} and cannot be triggered",
                self.id, self.status
            )));
        }
        if self.due_at > now {
            self.due_at = now;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Merge an enrichment map from the context builder.
    pub fn enrich(&mut self, enrichment: Map<String, Value>, now: DateTime<Utc>) {
        context::enrich_context(&mut self.context, enrichment);
        self.updated_at = now;
    }

    pub fn check_invariants(&self) -> DomainResult<()> {
        if self.completed
            && !matches!(self.status, TaskStatus::Completed | TaskStatus::Cancelled)
        {
            return Err(DomainError::invariant(format!(
                "completed task must be completed or cancelled, found {}",
                self.status
            )));
        }
        if self.claimed_at.is_some() && self.status != TaskStatus::InProgress {
            return Err(DomainError::invariant(format!(
                "only an in_progress task may hold a claim, found {}",
                self.status
            )));
        }
        if self.status == TaskStatus::Completed && self.call_record_id.is_none() {
            return Err(DomainError::invariant(
                "completed task must reference its call record",
            ));
        }
        Ok(())
    }
}
