//! Backend that keeps nothing

use super::{Backend, Change, State};
use crate::error::Result;

pub struct MemoryBackend;

impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn load(&mut self) -> Result<State> {
        Ok(State::default())
    }

    fn persist(&mut self, _change: Change<'_>, _state: &State) -> Result<()> {
        Ok(())
    }
}
