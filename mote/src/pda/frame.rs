//! Runtime stack frames and the execution tape.

use crate::agent::Step;
use crate::message::Message;
use crate::usage::Usage;

/// One agent invocation on the execution stack.
///
/// A frame owns a copy of the agent's steps, so resumption is independent
/// of later catalog edits, and a frame-local append-only context.
#[derive(Debug, Clone)]
pub struct StackFrame {
    /// Name of the agent this frame executes.
    pub agent: String,
    /// Cursor into `steps`; `0..=total_steps`, where `total_steps` means
    /// the frame is exhausted and pops on the next transition.
    pub step_index: usize,
    /// The agent's steps, copied at push time.
    pub steps: Vec<Step>,
    /// Frame-local conversation context. Append-only within the frame.
    pub context: Vec<Message>,
    /// Self-recursion count recorded on this frame's agent.
    pub recursion_count: u32,
}

impl StackFrame {
    /// Create a frame positioned at the first step.
    #[must_use]
    pub fn new(agent: impl Into<String>, steps: Vec<Step>, context: Vec<Message>) -> Self {
        Self {
            agent: agent.into(),
            step_index: 0,
            steps,
            context,
            recursion_count: 0,
        }
    }

    /// Total steps in this frame.
    #[must_use]
    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    /// Whether the cursor has reached the end of the steps.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.step_index >= self.steps.len()
    }

    /// The step the cursor points at, if not exhausted.
    #[must_use]
    pub fn current_step(&self) -> Option<&Step> {
        self.steps.get(self.step_index)
    }
}

/// The PDA tape: the frame stack plus session-wide counters.
#[derive(Debug, Default)]
pub struct ExecutionState {
    frames: Vec<StackFrame>,
    /// Session-wide self-recursion counter for the root agent.
    pub recursion_count: u32,
    /// Accumulated token usage across all transitions.
    pub usage: Usage,
}

impl ExecutionState {
    /// Create a state with a single root frame.
    #[must_use]
    pub fn new(root: StackFrame) -> Self {
        Self {
            frames: vec![root],
            recursion_count: 0,
            usage: Usage::zero(),
        }
    }

    /// Create a state from restored frames (bottom first).
    #[must_use]
    pub fn from_frames(frames: Vec<StackFrame>, recursion_count: u32, usage: Usage) -> Self {
        Self {
            frames,
            recursion_count,
            usage,
        }
    }

    /// Push a child frame; the pushed frame becomes the executing top.
    pub fn push(&mut self, frame: StackFrame) {
        self.frames.push(frame);
    }

    /// Pop the top frame.
    pub fn pop(&mut self) -> Option<StackFrame> {
        self.frames.pop()
    }

    /// The currently executing frame.
    #[must_use]
    pub fn top(&self) -> Option<&StackFrame> {
        self.frames.last()
    }

    /// Mutable access to the currently executing frame.
    pub fn top_mut(&mut self) -> Option<&mut StackFrame> {
        self.frames.last_mut()
    }

    /// Current stack depth.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Whether execution is complete.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// All frames, bottom first.
    #[must_use]
    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_bounds_track_exhaustion() {
        let mut frame = StackFrame::new(
            "main",
            vec![Step::prompt("a"), Step::prompt("b")],
            vec![Message::user("go")],
        );
        assert!(!frame.is_exhausted());
        frame.step_index = 2;
        assert!(frame.is_exhausted());
        assert!(frame.current_step().is_none());
    }

    #[test]
    fn push_pop_is_lifo() {
        let mut state = ExecutionState::new(StackFrame::new("root", vec![], vec![]));
        state.push(StackFrame::new("child", vec![], vec![]));

        assert_eq!(state.depth(), 2);
        assert_eq!(state.top().unwrap().agent, "child");
        assert_eq!(state.pop().unwrap().agent, "child");
        assert_eq!(state.top().unwrap().agent, "root");
    }
}
