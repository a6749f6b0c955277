use std::fmt;
use std::sync::{Arc, Barrier, Mutex, PoisonError};

/// A group of cooperating processes.
///
/// Every method is collective: all ranks must call it in the same order, or the group blocks.
pub trait Collective: Send + Sync + fmt::Debug {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Each rank contributes `local`; every rank receives all contributions indexed by rank.
    fn all_gather(&self, local: Vec<f64>) -> Vec<Vec<f64>>;

    fn broadcast(&self, root: usize, data: Vec<f64>) -> Vec<f64> {
        let local = if self.rank() == root { data } else { Vec::new() };
        let mut gathered = self.all_gather(local);
        if root < gathered.len() {
            gathered.swap_remove(root)
        } else {
            Vec::new()
        }
    }

    /// `Ok` if every rank reports success, otherwise the lowest failing rank.
    fn all_agree(&self, ok: bool) -> Result<(), usize> {
        let flags = self.all_gather(vec![if ok { 1.0 } else { 0.0 }]);
        match flags.iter().position(|f| f.first() != Some(&1.0)) {
            Some(rank) => Err(rank),
            None => Ok(()),
        }
    }
}

/// The trivial single-process collective.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialComm;

impl Collective for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_gather(&self, local: Vec<f64>) -> Vec<Vec<f64>> {
        vec![local]
    }
}

struct Exchange {
    size: usize,
    slots: Mutex<Vec<Vec<f64>>>,
    barrier: Barrier,
}

/// An in-process collective whose ranks are threads sharing an exchange area.
///
/// Useful for running a problem on several threads exactly as it would run on several
/// processes, and for checking that distributed results match serial ones.
#[derive(Clone)]
pub struct LocalComm {
    rank: usize,
    exchange: Arc<Exchange>,
}

impl LocalComm {
    /// Creates one handle per rank; hand each to its own thread.
    pub fn group(size: usize) -> Vec<LocalComm> {
        let size = size.max(1);
        let exchange = Arc::new(Exchange {
            size,
            slots: Mutex::new(vec![Vec::new(); size]),
            barrier: Barrier::new(size),
        });
        (0..size)
            .map(|rank| LocalComm {
                rank,
                exchange: Arc::clone(&exchange),
            })
            .collect()
    }
}

impl fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalComm")
            .field("rank", &self.rank)
            .field("size", &self.exchange.size)
            .finish()
    }
}

impl Collective for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.exchange.size
    }

    fn all_gather(&self, local: Vec<f64>) -> Vec<Vec<f64>> {
        {
            let mut slots = self
                .exchange
                .slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            slots[self.rank] = local;
        }
        self.exchange.barrier.wait();
        let gathered = self
            .exchange
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        // Nobody may overwrite a slot before every rank has read the round.
        self.exchange.barrier.wait();
        gathered
    }
}
