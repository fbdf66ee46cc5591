use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::message::Frame;

/// One end of a bidirectional frame channel.
#[derive(Debug)]
pub struct Port {
    pub(crate) tx: UnboundedSender<Frame>,
    pub(crate) rx: UnboundedReceiver<Frame>,
}

impl Port {
    /// Create two connected ports; frames sent on one arrive on the other.
    pub fn pair() -> (Port, Port) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Port { tx: a_tx, rx: a_rx }, Port { tx: b_tx, rx: b_rx })
    }
}
