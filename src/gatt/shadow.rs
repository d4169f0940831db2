/// Optional live transport handle held by every proxy record.
///
/// A shadow is attached while its peripheral is connected and detached
/// otherwise. Detached records stay in the arena so application-held proxies
/// keep their identity across reconnects.
#[derive(Debug, Clone)]
pub(crate) struct Shadow<H> {
    handle: Option<H>,
}

impl<H> Default for Shadow<H> {
    fn default() -> Self {
        Self { handle: None }
    }
}

impl<H: Clone> Shadow<H> {
    pub(crate) fn attached(handle: H) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Installs `handle`, returning the previous one.
    pub(crate) fn attach(&mut self, handle: H) -> Option<H> {
        self.handle.replace(handle)
    }

    /// Clears the handle, returning it.
    pub(crate) fn detach(&mut self) -> Option<H> {
        self.handle.take()
    }

    pub(crate) fn handle(&self) -> Option<&H> {
        self.handle.as_ref()
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.handle.is_some()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn attach_replaces_and_detach_clears() {
        let mut shadow = Shadow::attached(1_u8);
        assert_eq!(Some(1), shadow.attach(2));
        assert_eq!(Some(&2), shadow.handle());
        assert_eq!(Some(2), shadow.detach());
        assert!(!shadow.is_attached());
        assert_eq!(None, shadow.detach());
    }
}
