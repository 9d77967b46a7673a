/// Step that performs no computation. Useful as a placeholder for an
/// operation to be put in place later, or to duplicate and rename values by
/// binding its output ports to its own input ports.
#[derive(Debug, Clone, Default)]
pub struct NoOpStep;
