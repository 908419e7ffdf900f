/// Commands sent from the UI thread to a running video reader.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlCommand {
    Play,
    Pause,
    /// Jump to a position in milliseconds.
    Seek(f64),
}
