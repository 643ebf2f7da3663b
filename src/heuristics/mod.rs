use crate::{utils::VarSet, Variable, VariableHeuristic, WidthHeuristic};

#[derive(Debug, Clone, Copy)]
pub struct Fixed(pub usize);
impl<T> WidthHeuristic<T> for Fixed {
    fn max_width(&self, _state: &T) -> usize {
        self.0
    }
}

/// Branches on the variables in their natural order: `Variable(0)` first,
/// then `Variable(1)`, and so on until none is left.
#[derive(Debug, Default, Clone, Copy)]
pub struct NaturalOrder;
impl<T> VariableHeuristic<T> for NaturalOrder {
    fn next_variable(
        &self,
        free_vars: &VarSet,
        _next_layer: &mut dyn Iterator<Item = &T>,
    ) -> Option<Variable> {
        free_vars.iter().next()
    }
}
