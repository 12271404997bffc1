use std::sync::Arc;

/// Behavior shared by every component stepped by the global clock.
pub trait ModuleBehaviors {
    /// Advance the component by one cycle.
    fn tick_one(&mut self);

    fn reset(&mut self) {}
}

pub trait Parameterizable {
    type ConfigType;

    fn conf(&self) -> &Self::ConfigType;

    fn init_conf(&mut self, conf: Arc<Self::ConfigType>);
}

/// Two-phase clocked component.
///
/// `evaluate` computes the next state from the committed state and this cycle's inputs
/// without mutating anything. The top level evaluates every component against the same
/// snapshot before it calls `commit` on any of them, so no component ever observes another
/// component's next-state value within a cycle.
pub trait Clocked {
    type Input;
    type Next;

    fn evaluate(&self, input: &Self::Input) -> Self::Next;

    fn commit(&mut self, next: Self::Next);
}
