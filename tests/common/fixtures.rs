// Test fixtures and data generators for integration tests

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use warden::lock::ByteSpan;
use warden::types::{ClientId, LockOwner};

/// Deterministic random lock request generator for reproducible tests
pub struct LockRequestGenerator {
    rng: StdRng,
    clients: usize,
    max_offset: u64,
}

/// One generated request.
#[derive(Debug, Clone)]
pub struct GeneratedRequest {
    pub owner: LockOwner,
    pub span: ByteSpan,
    pub exclusive: bool,
}

impl LockRequestGenerator {
    /// Creates a new generator with a fixed seed for reproducibility
    pub fn new(seed: u64, clients: usize, max_offset: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            clients,
            max_offset,
        }
    }

    /// Random span; roughly one in ten extends to end of file
    pub fn span(&mut self) -> ByteSpan {
        let offset = self.rng.gen_range(0..self.max_offset);
        if self.rng.gen_ratio(1, 10) {
            ByteSpan::to_end(offset)
        } else {
            ByteSpan::new(offset, self.rng.gen_range(1..=self.max_offset / 4))
        }
    }

    /// Random owner among the configured clients
    pub fn owner(&mut self) -> LockOwner {
        let client = self.rng.gen_range(0..self.clients);
        let handle = self.rng.gen_range(0..2u8);
        LockOwner::new(ClientId::new(format!("client-{}", client)), vec![handle])
    }

    /// Random request
    pub fn request(&mut self) -> GeneratedRequest {
        GeneratedRequest {
            owner: self.owner(),
            span: self.span(),
            exclusive: self.rng.gen_bool(0.4),
        }
    }

    /// Random choice with probability `p`
    pub fn chance(&mut self, p: f64) -> bool {
        self.rng.gen_bool(p)
    }
}
