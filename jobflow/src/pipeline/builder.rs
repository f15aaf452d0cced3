//! Pipeline builder with validation.

use super::engine::Pipeline;
use super::stage::{StageOptions, StageSpec, Transform};
use crate::clock::SharedClock;
use crate::errors::ConfigError;
use crate::events::{noop_sink, SharedEventSink};
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use std::collections::HashSet;

/// Builder for linear pipelines.
///
/// Stages run in the order they are added. Each stage reads from its own
/// bounded input queue, whose capacity is given when the stage is added,
/// and writes into the next stage's input. The last stage writes into the
/// pipeline output.
pub struct PipelineBuilder<T> {
    /// The pipeline name.
    name: String,
    /// Stages in execution order.
    stages: Vec<StageSpec<T>>,
    /// Names already taken.
    stage_names: HashSet<String>,
    output_capacity: usize,
    error_capacity: Option<usize>,
    clock: Option<SharedClock>,
    events: SharedEventSink,
}

impl<T: Clone + Send + 'static> PipelineBuilder<T> {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            stage_names: HashSet::new(),
            output_capacity: DEFAULT_QUEUE_CAPACITY,
            error_capacity: None,
            clock: None,
            events: noop_sink(),
        }
    }

    /// Appends a stage.
    ///
    /// `queue_capacity` sizes the stage's input queue; 0 makes it a
    /// rendezvous queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker count is zero, the name is empty or
    /// taken, or the options are invalid.
    pub fn add_stage(
        mut self,
        name: impl AsRef<str>,
        workers: usize,
        queue_capacity: usize,
        transform: impl Transform<T> + 'static,
        options: StageOptions,
    ) -> Result<Self, ConfigError> {
        self.add_stage_spec(StageSpec::new(name, workers, queue_capacity, transform, options))?;
        Ok(self)
    }

    /// Appends a prepared stage.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn add_stage_spec(&mut self, spec: StageSpec<T>) -> Result<(), ConfigError> {
        spec.validate()?;
        if !self.stage_names.insert(spec.name().to_string()) {
            return Err(ConfigError::new(
                "name",
                format!("stage '{}' is already defined", spec.name()),
            ));
        }
        self.stages.push(spec);
        Ok(())
    }

    /// Sets the capacity of the pipeline output queue.
    #[must_use]
    pub fn with_output_capacity(mut self, capacity: usize) -> Self {
        self.output_capacity = capacity;
        self
    }

    /// Routes stage errors to a queue of the given capacity.
    ///
    /// Without an error queue, errors are logged and dropped. Workers
    /// block when the error queue is full, so it must be drained.
    #[must_use]
    pub fn with_error_queue(mut self, capacity: usize) -> Self {
        self.error_capacity = Some(capacity);
        self
    }

    /// Uses `clock` for batch flushing, rate limiting and timing.
    ///
    /// Defaults to the clock of the scope passed to
    /// [`Pipeline::start`].
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: SharedEventSink) -> Self {
        self.events = events;
        self
    }

    /// Returns the number of stages added so far.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Builds the pipeline and its queues. Nothing runs until
    /// [`Pipeline::start`].
    ///
    /// # Errors
    ///
    /// Returns an error if no stage was added.
    pub fn build(self) -> Result<Pipeline<T>, ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::new(
                "stages",
                format!("pipeline '{}' has no stages", self.name),
            ));
        }
        Ok(Pipeline::new(
            self.name,
            self.stages,
            self.output_capacity,
            self.error_capacity,
            self.clock,
            self.events,
        ))
    }
}

impl<T> std::fmt::Debug for PipelineBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("name", &self.name)
            .field("stages", &self.stages)
            .field("output_capacity", &self.output_capacity)
            .field("error_capacity", &self.error_capacity)
            .finish_non_exhaustive()
    }
}
