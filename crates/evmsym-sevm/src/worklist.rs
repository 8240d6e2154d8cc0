// SPDX-License-Identifier: AGPL-3.0

//! Worklist of forked paths awaiting exploration

/// Depth-first stack of pending paths
#[derive(Debug)]
pub struct Worklist<T> {
    stack: Vec<T>,
    /// Paths that reached the end of their transaction
    pub completed_paths: usize,
}

impl<T> Worklist<T> {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            completed_paths: 0,
        }
    }

    pub fn push(&mut self, item: T) {
        self.stack.push(item);
    }

    /// Most recently forked path first
    pub fn pop(&mut self) -> Option<T> {
        self.stack.pop()
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn mark_completed(&mut self) {
        self.completed_paths += 1;
    }
}

impl<T> Default for Worklist<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Extend<T> for Worklist<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.stack.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worklist_dfs() {
        let mut worklist: Worklist<i32> = Worklist::new();
        assert!(worklist.is_empty());

        worklist.push(1);
        worklist.extend([2, 3]);
        assert_eq!(worklist.len(), 3);

        // last in, first out
        assert_eq!(worklist.pop(), Some(3));
        assert_eq!(worklist.pop(), Some(2));
        assert_eq!(worklist.pop(), Some(1));
        assert_eq!(worklist.pop(), None);
    }

    #[test]
    fn test_worklist_completed_count() {
        let mut worklist: Worklist<i32> = Worklist::default();
        worklist.mark_completed();
        worklist.mark_completed();
        assert_eq!(worklist.completed_paths, 2);
    }
}
