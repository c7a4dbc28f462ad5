use crate::error::PoolError;

/// Keeps job outcomes in submission order while they arrive in completion
/// order. Every reserved index must be recorded exactly once.
#[derive(Debug)]
pub struct ResultCollector<T> {
  slots: Vec<Option<T>>,
  recorded: usize,
}

impl<T> Default for ResultCollector<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> ResultCollector<T> {
  pub fn new() -> Self {
    Self {
      slots: Vec::new(),
      recorded: 0,
    }
  }

  /// Adds one expected outcome and returns its index.
  pub fn reserve(&mut self) -> usize {
    self.slots.push(None);
    self.slots.len() - 1
  }

  /// Stores the outcome of `index`.
  ///
  /// # Errors
  /// `PoolError::Protocol` if the index was never reserved or was already recorded.
  pub fn record(&mut self, index: usize, outcome: T) -> Result<(), PoolError> {
    let expected = self.slots.len();
    let slot = self.slots.get_mut(index).ok_or_else(|| {
      PoolError::Protocol(format!("result for unknown job index {index} (only {expected} submitted)"))
    })?;
    if slot.is_some() {
      return Err(PoolError::Protocol(format!("job {index} resolved twice")));
    }
    *slot = Some(outcome);
    self.recorded += 1;
    Ok(())
  }

  pub fn is_recorded(&self, index: usize) -> bool {
    self.slots.get(index).is_some_and(Option::is_some)
  }

  pub fn recorded(&self) -> usize {
    self.recorded
  }

  pub fn expected(&self) -> usize {
    self.slots.len()
  }

  pub fn is_complete(&self) -> bool {
    self.recorded == self.slots.len()
  }

  /// Indices that have no outcome yet, in ascending order.
  pub fn missing(&self) -> impl Iterator<Item = usize> + '_ {
    self
      .slots
      .iter()
      .enumerate()
      .filter_map(|(index, slot)| slot.is_none().then_some(index))
  }
}

impl<T: Clone> ResultCollector<T> {
  /// Returns every outcome ordered by index.
  ///
  /// # Errors
  /// `PoolError::Incomplete` while any reserved index is still unrecorded.
  pub fn finalize(&self) -> Result<Vec<T>, PoolError> {
    if !self.is_complete() {
      return Err(PoolError::Incomplete {
        recorded: self.recorded,
        expected: self.slots.len(),
      });
    }
    Ok(self.slots.iter().flatten().cloned().collect())
  }
}
