//! Per-call state shared between the orchestrator and interceptors.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::message::{HttpRequest, HttpResponse};

/// A named, type-tagged attribute key. Keys with the same name but different
/// value types address different slots.
pub struct AttributeKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttributeKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for AttributeKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AttributeKey<T> {}

impl<T> std::fmt::Debug for AttributeKey<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_tuple("AttributeKey")
            .field(&self.name)
            .finish()
    }
}

type Slot = (TypeId, &'static str);

#[derive(Default)]
pub struct ExecutionAttributes {
    values: HashMap<Slot, Box<dyn Any + Send + Sync>>,
}

impl ExecutionAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot<T: 'static>(key: &AttributeKey<T>) -> Slot {
        (TypeId::of::<T>(), key.name)
    }

    pub fn insert<T>(&mut self, key: &AttributeKey<T>, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.values
            .insert(Self::slot(key), Box::new(value))
            .and_then(|previous| previous.downcast::<T>().ok())
            .map(|previous| *previous)
    }

    pub fn get<T: 'static>(&self, key: &AttributeKey<T>) -> Option<&T> {
        self.values
            .get(&Self::slot(key))
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T: 'static>(&mut self, key: &AttributeKey<T>) -> Option<&mut T> {
        self.values
            .get_mut(&Self::slot(key))
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove<T: 'static>(&mut self, key: &AttributeKey<T>) -> Option<T> {
        self.values
            .remove(&Self::slot(key))
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn contains<T: 'static>(&self, key: &AttributeKey<T>) -> bool {
        self.values.contains_key(&Self::slot(key))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Debug for ExecutionAttributes {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_set()
            .entries(self.values.keys().map(|(_, name)| name))
            .finish()
    }
}

/// Orchestrator state machine for one call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Marshalling,
    Signing,
    Transmitting,
    Classifying,
    Retrying,
    Success,
    Failed,
}

impl Phase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Marshalling => "marshalling",
            Self::Signing => "signing",
            Self::Transmitting => "transmitting",
            Self::Classifying => "classifying",
            Self::Retrying => "retrying",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (_, Self::Failed) => !self.is_terminal(),
            (Self::Marshalling, Self::Signing)
            | (Self::Signing, Self::Transmitting)
            | (Self::Transmitting, Self::Classifying)
            | (Self::Transmitting, Self::Retrying)
            | (Self::Classifying, Self::Success)
            | (Self::Classifying, Self::Retrying)
            | (Self::Retrying, Self::Signing) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Everything known about one logical call. Owned by the orchestrator;
/// interceptors see it between stages.
pub struct ExecutionContext {
    service: String,
    operation: &'static str,
    phase: Phase,
    attempt: u32,
    max_attempts: u32,
    input: Option<Box<dyn Any + Send + Sync>>,
    output: Option<Box<dyn Any + Send + Sync>>,
    request: Option<HttpRequest>,
    response: Option<HttpResponse>,
    pub(crate) template: Option<HttpRequest>,
    attributes: ExecutionAttributes,
    call_started_at: Instant,
    attempt_started_at: Option<Instant>,
    attempt_durations: Vec<Duration>,
    delays: Vec<Duration>,
}

impl ExecutionContext {
    pub(crate) fn new<I>(service: &str, operation: &'static str, max_attempts: u32, input: I) -> Self
    where
        I: Send + Sync + 'static,
    {
        Self {
            service: service.to_owned(),
            operation,
            phase: Phase::Marshalling,
            attempt: 0,
            max_attempts,
            input: Some(Box::new(input)),
            output: None,
            request: None,
            response: None,
            template: None,
            attributes: ExecutionAttributes::new(),
            call_started_at: Instant::now(),
            attempt_started_at: None,
            attempt_durations: Vec::new(),
            delays: Vec::new(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Current attempt, 1-based; 0 before the first attempt starts.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn input<T: 'static>(&self) -> Option<&T> {
        self.input.as_ref()?.downcast_ref::<T>()
    }

    pub fn input_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.input.as_mut()?.downcast_mut::<T>()
    }

    pub fn output<T: 'static>(&self) -> Option<&T> {
        self.output.as_ref()?.downcast_ref::<T>()
    }

    pub fn output_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.output.as_mut()?.downcast_mut::<T>()
    }

    pub fn request(&self) -> Option<&HttpRequest> {
        self.request.as_ref()
    }

    pub fn request_mut(&mut self) -> Option<&mut HttpRequest> {
        self.request.as_mut()
    }

    pub fn response(&self) -> Option<&HttpResponse> {
        self.response.as_ref()
    }

    pub fn response_mut(&mut self) -> Option<&mut HttpResponse> {
        self.response.as_mut()
    }

    pub fn attributes(&self) -> &ExecutionAttributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut ExecutionAttributes {
        &mut self.attributes
    }

    pub fn elapsed(&self) -> Duration {
        self.call_started_at.elapsed()
    }

    pub fn attempt_durations(&self) -> &[Duration] {
        &self.attempt_durations
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    pub(crate) fn transition(&mut self, next: Phase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "illegal phase transition {} -> {}",
            self.phase,
            next
        );
        debug!(
            operation = self.operation,
            attempt = self.attempt,
            from = self.phase.as_str(),
            to = next.as_str(),
            "phase transition"
        );
        self.phase = next;
    }

    pub(crate) fn begin_attempt(&mut self) -> u32 {
        self.attempt = self.attempt.saturating_add(1);
        self.attempt_started_at = Some(Instant::now());
        self.response = None;
        self.attempt
    }

    /// Closes the running attempt and returns its duration.
    pub(crate) fn end_attempt(&mut self) -> Duration {
        let duration = self
            .attempt_started_at
            .take()
            .map(|started| started.elapsed())
            .unwrap_or_default();
        self.attempt_durations.push(duration);
        duration
    }

    pub(crate) fn record_delay(&mut self, delay: Duration) {
        self.delays.push(delay);
    }

    pub(crate) fn set_output<T: Send + Sync + 'static>(&mut self, output: T) {
        self.output = Some(Box::new(output));
    }

    pub(crate) fn take_output<T: 'static>(&mut self) -> Option<T> {
        let output = self.output.take()?;
        output.downcast::<T>().ok().map(|output| *output)
    }

    pub(crate) fn set_request(&mut self, request: HttpRequest) {
        self.request = Some(request);
    }

    pub(crate) fn take_request(&mut self) -> Option<HttpRequest> {
        self.request.take()
    }

    pub(crate) fn set_response(&mut self, response: HttpResponse) {
        self.response = Some(response);
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ExecutionContext")
            .field("service", &self.service)
            .field("operation", &self.operation)
            .field("phase", &self.phase)
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.max_attempts)
            .field("attributes", &self.attributes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::{AttributeKey, ExecutionAttributes, ExecutionContext, Phase};

    const REGION: AttributeKey<String> = AttributeKey::new("region");
    const REGION_COUNT: AttributeKey<u32> = AttributeKey::new("region");

    #[test]
    fn same_name_different_type_does_not_collide() {
        let mut attributes = ExecutionAttributes::new();
        attributes.insert(&REGION, "us-west-2".to_owned());
        attributes.insert(&REGION_COUNT, 2);

        assert_eq!(attributes.get(&REGION).map(String::as_str), Some("us-west-2"));
        assert_eq!(attributes.get(&REGION_COUNT), Some(&2));
        assert_eq!(attributes.len(), 2);

        assert_eq!(attributes.remove(&REGION_COUNT), Some(2));
        assert!(attributes.contains(&REGION));
    }

    #[test]
    fn insert_returns_previous_value() {
        let mut attributes = ExecutionAttributes::new();
        assert_eq!(attributes.insert(&REGION_COUNT, 1), None);
        assert_eq!(attributes.insert(&REGION_COUNT, 5), Some(1));
        if let Some(value) = attributes.get_mut(&REGION_COUNT) {
            *value += 1;
        }
        assert_eq!(attributes.get(&REGION_COUNT), Some(&6));
    }

    #[test]
    fn attempts_increase_by_one_and_record_durations() {
        let mut context = ExecutionContext::new("svc", "GetThing", 3, 42_u32);
        assert_eq!(context.attempt(), 0);
        assert_eq!(context.begin_attempt(), 1);
        context.end_attempt();
        assert_eq!(context.begin_attempt(), 2);
        context.end_attempt();
        assert_eq!(context.attempt_durations().len(), 2);
        assert_eq!(context.input::<u32>(), Some(&42));
        assert_eq!(context.input::<String>(), None);
    }

    #[test]
    fn typed_input_round_trips_through_take_and_restore() {
        let mut context = ExecutionContext::new("svc", "PutThing", 1, "body".to_owned());
        assert_eq!(context.take_input::<u8>(), None);
        let input = context.take_input::<String>().expect("input is a String");
        assert_eq!(input, "body");
        context.restore_input(input);
        assert!(context.input::<String>().is_some());
    }

    #[test]
    fn phase_transitions_follow_the_state_machine() {
        assert!(Phase::Marshalling.can_transition_to(Phase::Signing));
        assert!(Phase::Classifying.can_transition_to(Phase::Retrying));
        assert!(Phase::Retrying.can_transition_to(Phase::Signing));
        assert!(Phase::Transmitting.can_transition_to(Phase::Failed));
        assert!(!Phase::Success.can_transition_to(Phase::Failed));
        assert!(!Phase::Marshalling.can_transition_to(Phase::Transmitting));
        assert!(!Phase::Retrying.can_transition_to(Phase::Success));
    }
}
