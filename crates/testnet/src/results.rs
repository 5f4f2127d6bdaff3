//! Per-node outcome of one polling round, with a tolerance for transient errors.

use color_eyre::eyre;
use tracing::info;

#[derive(Debug, Default)]
pub struct NodeResult {
    pub index: usize,
    pub name: String,
    pub msg: String,
    /// Transient failure, tolerated up to `max_err` rounds in a row.
    pub err: Option<eyre::Report>,
    pub fatal: Option<eyre::Report>,
    pub done: bool,
    err_count: usize,
    max_err: usize,
}

impl NodeResult {
    fn clear(&mut self) {
        self.msg.clear();
        self.err = None;
        self.fatal = None;
        self.done = false;
    }
}

/// Results of every polled node, in node order.
#[derive(Debug, Default)]
pub struct Results(pub Vec<NodeResult>);

impl Results {
    pub fn new<'a>(nodes: impl IntoIterator<Item = (usize, &'a str)>, max_err: usize) -> Self {
        Results(
            nodes
                .into_iter()
                .map(|(index, name)| NodeResult { index, name: name.to_owned(), max_err, ..Default::default() })
                .collect(),
        )
    }

    /// Resets every result for the next round; error counters survive.
    pub fn clear(&mut self) {
        self.0.iter_mut().for_each(NodeResult::clear);
    }

    pub fn get_mut(&mut self, i: usize) -> Option<&mut NodeResult> {
        self.0.get_mut(i)
    }

    /// Fails on a fatal result or on an error that repeated `max_err` times.
    ///
    /// Errors below the threshold become a warning message and bump the
    /// node's counter; a round without error resets it.
    pub fn check_errors(&mut self) -> eyre::Result<()> {
        for r in &mut self.0 {
            if let Some(fatal) = r.fatal.take() {
                return Err(fatal.wrap_err(format!("node {} ({})", r.index, r.name)));
            }
            match r.err.take() {
                Some(err) if r.err_count >= r.max_err => {
                    return Err(err.wrap_err(format!("node {} ({}): too many consecutive errors", r.index, r.name)));
                }
                Some(err) => {
                    r.msg = format!("WARN: node {} ({}): error {}/{}: {err}", r.index, r.name, r.err_count + 1, r.max_err);
                    r.err_count += 1;
                }
                None => r.err_count = 0,
            }
        }
        Ok(())
    }

    pub fn print_messages(&self) {
        for r in self.0.iter().filter(|r| !r.msg.is_empty()) {
            info!(node = r.index, "{}", r.msg);
        }
    }

    pub fn all_done(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|r| r.done)
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::eyre::eyre;

    use super::*;

    fn results() -> Results {
        Results::new([(0, "lighthouse"), (1, "teku")], 2)
    }

    #[test]
    fn transient_errors_are_tolerated_up_to_max() {
        let mut r = results();
        for round in 1..=2 {
            r.clear();
            r.0[1].err = Some(eyre!("timeout"));
            r.check_errors().unwrap();
            assert_eq!(r.0[1].msg, format!("WARN: node 1 (teku): error {round}/2: timeout"));
        }
        r.clear();
        r.0[1].err = Some(eyre!("timeout"));
        let err = r.check_errors().unwrap_err();
        assert!(format!("{err:#}").contains("node 1 (teku)"));
    }

    #[test]
    fn successful_round_resets_counter() {
        let mut r = results();
        r.0[0].err = Some(eyre!("boom"));
        r.check_errors().unwrap();
        r.clear();
        r.check_errors().unwrap();
        for _ in 0..2 {
            r.clear();
            r.0[0].err = Some(eyre!("boom"));
            r.check_errors().unwrap();
        }
    }

    #[test]
    fn fatal_fails_immediately() {
        let mut r = results();
        r.0[0].fatal = Some(eyre!("finality stalled"));
        let err = r.check_errors().unwrap_err();
        assert_eq!(format!("{err}"), "node 0 (lighthouse)");
        assert!(format!("{err:#}").contains("finality stalled"));
    }

    #[test]
    fn all_done_needs_every_node() {
        let mut r = results();
        assert!(!r.all_done());
        r.0[0].done = true;
        assert!(!r.all_done());
        r.0[1].done = true;
        assert!(r.all_done());
        assert!(!Results::default().all_done());
    }
}
