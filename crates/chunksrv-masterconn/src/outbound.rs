use chunksrv_proto::Frame;
use std::collections::VecDeque;
use std::sync::Mutex;

/// The output queue a connection drains in its write loop. Reply frames
/// are attached once their job has finished; frames built directly (NOP,
/// telemetry pushes) are attached immediately.
#[derive(Default)]
pub struct OutputQueue {
    frames: Mutex<VecDeque<Frame>>,
}

impl OutputQueue {
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
        }
    }

    pub fn attach(&self, frame: Frame) {
        self.frames.lock().unwrap().push_back(frame);
    }

    pub fn pop(&self) -> Option<Frame> {
        self.frames.lock().unwrap().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}
