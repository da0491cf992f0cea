use tokio::sync::watch;

/// Edge-triggered "configuration changed" signal. Mutating DAO calls
/// fire it so the reconciler can react ahead of its polling interval.
pub struct IntentChannel {
    intent_tx: watch::Sender<()>,
    intent_rx: watch::Receiver<()>,
}

impl IntentChannel {
    pub fn new() -> Self {
        let (intent_tx, intent_rx) = watch::channel(());
        Self {
            intent_tx,
            intent_rx,
        }
    }

    pub fn notify_intent(&self) {
        self.intent_tx
            .send(())
            .expect("Receiver is owned and should therefore be alive");
    }

    pub fn subscribe_intent(&self) -> watch::Receiver<()> {
        self.intent_rx.clone()
    }
}

impl Default for IntentChannel {
    fn default() -> Self {
        Self::new()
    }
}

pub trait NotifiableStore {
    fn subscribe_intent(&self) -> watch::Receiver<()>;
}
