//! The LETKF spread over a worker pool. The grid is cut into contiguous
//! chunks; every chunk is analysed as an independent task and the chunks
//! are put back together in grid order.

use nd::{concatenate, Array4, Axis};

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use na_core::{EnsembleState, Error, Localization, ObservationSet, Result};

use crate::cluster::{gather_chunks, Client, DistributedConfig, Future, LocalCluster};

use super::letkf::{analyse_points, Letkf};
use super::obs_space::ObsSpace;
use super::{check_pseudo_state, update_times, Analyser, FilterConfig};

#[derive(Debug, Clone)]
pub struct DistributedLetkf {
  letkf: Letkf,
  client: Client,
  chunk_size: usize,
}

impl DistributedLetkf {
  /// A given client is used as is; otherwise one is started on `cluster`.
  pub fn new(client: Option<Client>,
             cluster: Option<&LocalCluster>,
             chunk_size: usize,
             config: FilterConfig,
             localization: Option<Arc<dyn Localization>>) -> Result<DistributedLetkf>
  {
    if chunk_size == 0 {
      return Err(Error::configuration("the chunk size must be at least one"));
    }
    let client = Client::connect(client, cluster)?;

    Ok(DistributedLetkf {
      letkf: Letkf::new(config, localization)?,
      client,
      chunk_size,
    })
  }

  pub fn from_config(dist: &DistributedConfig,
                     config: FilterConfig,
                     localization: Option<Arc<dyn Localization>>) -> Result<DistributedLetkf> {
    DistributedLetkf::new(None, Some(&dist.cluster), dist.chunk_size, config, localization)
  }

  pub fn client(&self) -> &Client { &self.client }
  pub fn chunk_size(&self) -> usize { self.chunk_size }
  pub fn config(&self) -> &FilterConfig { self.letkf.config() }

  /// Queues one task per grid chunk and returns without waiting for them.
  pub fn submit(&self,
                state: &EnsembleState,
                observations: &[ObservationSet],
                pseudo_state: &EnsembleState,
                analysis_time: u64) -> Result<PendingAnalysis>
  {
    check_pseudo_state(state, pseudo_state)?;
    let times = update_times(state, analysis_time, self.config().smoother)?;
    let obs = Arc::new(ObsSpace::prepare(observations, pseudo_state, self.config().error_model)?);
    info!("distributed LETKF: {} members, {} grid points, {} observations, chunks of {}",
          state.ensemble_size(), state.n_grid(), obs.len(), self.chunk_size);

    let n_grid = state.n_grid();
    let mut chunks = Vec::new();
    for (index, start) in (0..n_grid).step_by(self.chunk_size).enumerate() {
      let range = start..(start + self.chunk_size).min(n_grid);
      let part = state.select_grid(range.clone())?;

      let engine = self.letkf.engine().clone();
      let localization = self.letkf.localization().cloned();
      let obs = obs.clone();
      let times = times.clone();
      debug!("submitting chunk {} with grid points {:?}", index, range);
      let future = self.client.submit(move || {
        let coords = part.grid().coords().to_owned();
        let mut values = part.into_values();
        analyse_points(&engine, localization.as_deref(), &obs, coords.view(),
                       values.view_mut(), times)?;
        Ok(values)
      });
      chunks.push(Chunk { range, future });
    }

    Ok(PendingAnalysis {
      template: state.clone(),
      chunks,
    })
  }
}

impl Analyser for DistributedLetkf {
  fn name(&self) -> &'static str { "distributed LETKF" }

  fn update_state(&self,
                  state: &EnsembleState,
                  observations: &[ObservationSet],
                  pseudo_state: &EnsembleState,
                  analysis_time: u64) -> Result<EnsembleState>
  {
    self.submit(state, observations, pseudo_state, analysis_time)?
      .compute()
  }
}

struct Chunk {
  range: Range<usize>,
  future: Future<Array4<f64>>,
}

/// A submitted analysis whose chunks may still be running.
pub struct PendingAnalysis {
  template: EnsembleState,
  chunks: Vec<Chunk>,
}

impl fmt::Debug for PendingAnalysis {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("PendingAnalysis")
      .field("chunks", &self.chunk_ranges())
      .finish()
  }
}

impl PendingAnalysis {
  pub fn n_chunks(&self) -> usize { self.chunks.len() }

  /// The grid points of every chunk, in submission order.
  pub fn chunk_ranges(&self) -> Vec<Range<usize>> {
    self.chunks.iter().map(|c| c.range.clone()).collect()
  }

  /// Waits for every chunk. A failed chunk is reported as `Error::Chunk`
  /// carrying its index; the other outcomes are unaffected.
  pub fn gather(self) -> Vec<Result<Array4<f64>>> {
    gather_chunks(self.chunks.into_iter().map(|c| c.future).collect())
  }

  /// Chunks whose task already finished.
  pub fn n_finished(&self) -> usize {
    self.chunks.iter().filter(|c| c.future.is_ready()).count()
  }

  /// The analysed state, or the first failing chunk.
  pub fn compute(self) -> Result<EnsembleState> {
    let PendingAnalysis { template, chunks } = self;
    let parts = gather_chunks(chunks.into_iter().map(|c| c.future).collect())
      .into_iter()
      .collect::<Result<Vec<_>>>()?;
    if parts.is_empty() {
      return Ok(template);
    }

    let views = parts.iter().map(|p| p.view()).collect::<Vec<_>>();
    let values = concatenate(Axis(3), &views)
      .map_err(|e| Error::Validation(e.to_string()))?;
    template.with_values(values)
  }
}
