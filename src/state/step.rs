//! Named build steps.

use anyhow::Result;
use std::fmt;

use super::Build;

type Action<'a> = Box<dyn Fn(&mut Build<'_>) -> Result<()> + 'a>;

/// One named unit of work. Steps are looked up by exact name.
pub struct Step<'a> {
    pub name: &'static str,
    action: Action<'a>,
}

impl<'a> Step<'a> {
    pub fn new(name: &'static str, action: impl Fn(&mut Build<'_>) -> Result<()> + 'a) -> Self {
        Self {
            name,
            action: Box::new(action),
        }
    }

    pub fn run(&self, build: &mut Build<'_>) -> Result<()> {
        (self.action)(build)
    }
}

impl fmt::Debug for Step<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Step").field(&self.name).finish()
    }
}

/// Index of the step called `name`.
pub fn position(steps: &[Step<'_>], name: &str) -> Option<usize> {
    steps.iter().position(|s| s.name == name)
}
