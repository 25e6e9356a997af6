//! Station streams and the baselines formed from them.

/// Receptor polarisation of a station stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Polarisation {
    Right,
    Left,
}

impl Polarisation {
    pub fn code(self) -> u8 {
        match self {
            Polarisation::Right => 0,
            Polarisation::Left => 1,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Polarisation::Right => Polarisation::Left,
            Polarisation::Left => Polarisation::Right,
        }
    }
}

/// One input stream of a job: a station observed in one polarisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamSpec {
    pub station: usize,
    pub polarisation: Polarisation,
}

/// Unordered pair of stream indices, `first <= second`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Baseline {
    pub first: usize,
    pub second: usize,
}

impl Baseline {
    pub fn is_auto(&self) -> bool {
        self.first == self.second
    }
}

/// All baselines over `n_streams` streams: autocorrelations first, then the
/// cross pairs in row-major order.
pub fn baselines(n_streams: usize) -> Vec<Baseline> {
    let autos = (0..n_streams).map(|i| Baseline {
        first: i,
        second: i,
    });
    let crosses = (0..n_streams)
        .flat_map(|i| (i + 1..n_streams).map(move |j| Baseline { first: i, second: j }));
    autos.chain(crosses).collect()
}
