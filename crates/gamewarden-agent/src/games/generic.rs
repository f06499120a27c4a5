use super::{ConnectionInfo, OutputLineHandler, ServerEvent};

const STARTUP_MARKERS: &[&str] = &["Done", "Server started", "Listening on"];

/// Script-launched servers without game-specific parsing: only startup is detected.
#[derive(Debug)]
pub struct GenericHandler {
    connection: ConnectionInfo,
}

impl GenericHandler {
    pub fn new(connection: ConnectionInfo) -> Self {
        Self { connection }
    }
}

impl OutputLineHandler for GenericHandler {
    fn handle_line(&mut self, line: &str) -> Option<ServerEvent> {
        STARTUP_MARKERS
            .iter()
            .any(|m| line.contains(m))
            .then(|| ServerEvent::StartupComplete(self.connection.clone()))
    }
}
