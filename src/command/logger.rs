use crossbeam::channel::Receiver;
use tracing::{debug, error};

use super::stream::{Event, OutputEvent};
use super::EventLogger;

/// Default log sink: tags every captured line with its process/instance and routes
/// stdout to `debug` and stderr to `error`. Consumes the channel until the producer
/// side is dropped, then returns.
pub struct EventReceiver {
    rx: Receiver<Event>,
}

impl EventReceiver {
    pub fn new(rx: Receiver<Event>) -> Self {
        Self { rx }
    }
}

impl EventLogger for EventReceiver {
    fn log(self) {
        for event in self.rx.iter() {
            let process = &event.metadata.process_name;
            let instance = &event.metadata.instance_id;
            match event.output {
                OutputEvent::Stdout(line) => {
                    debug!(process, instance, "{}", line);
                }
                OutputEvent::Stderr(line) => {
                    error!(process, instance, "{}", line);
                }
            }
        }
    }
}
