/// Stream of output events, either stdout or stderr, tagged with the instance that
/// produced them.
#[derive(Debug, Clone)]
pub enum OutputEvent {
    Stdout(String),
    Stderr(String),
}

/// Identifies which instance a streamed line or logged event came from, so a single
/// log sink can multiplex many instances without losing provenance.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub process_name: String,
    pub instance_id: String,
}

impl Metadata {
    pub fn new(process_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            instance_id: instance_id.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub metadata: Metadata,
    pub output: OutputEvent,
}

impl Event {
    pub fn new(metadata: Metadata, output: OutputEvent) -> Self {
        Self { metadata, output }
    }
}
