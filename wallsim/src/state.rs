pub struct WallsimState {
    pub ready: (
        tokio::sync::watch::Sender<bool>,
        tokio::sync::watch::Receiver<bool>,
    ),
}

impl Default for WallsimState {
    fn default() -> Self {
        Self::new()
    }
}

impl WallsimState {
    pub fn new() -> Self {
        WallsimState {
            ready: tokio::sync::watch::channel(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.1.borrow()
    }
}
