//! Weighted graphs over pdf-ids.
//!
//! The same representation serves the shared denominator graph and the per-sequence numerator
//! (supervision) graphs. Every transition consumes exactly one frame of network output and
//! carries the pdf-id whose output is read on that frame, so a path of `T` transitions scores a
//! sequence of `T` frames:
//!
//! ```text
//! alpha(0, s)   = initial(s)
//! alpha(t+1, j) = logsumexp_{i -> j} alpha(t, i) + log_prob(i -> j) + output(t, pdf_id(i -> j))
//! total         = logsumexp_s alpha(T, s) + final(s)
//! ```
//!
//! States may loop on themselves, which is how a state persists over several frames. A graph is
//! immutable once built; share it with `Arc<Graph>`.

use candle::{bail, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::Path;

const BINARY_MAGIC: &[u8; 4] = b"CHNG";
const BINARY_VERSION: u32 = 1;

/// A weighted transition between two states, emitting one pdf-id.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub src: u32,
    pub dst: u32,
    pub pdf_id: u32,
    pub log_prob: f32,
}

impl Transition {
    pub fn new(src: u32, dst: u32, pdf_id: u32, log_prob: f32) -> Self {
        Self {
            src,
            dst,
            pdf_id,
            log_prob,
        }
    }
}

/// Sparse on-disk form used by the text format. Only finite weights are listed.
#[derive(Serialize, Deserialize)]
struct GraphDef {
    num_states: usize,
    initial: Vec<(u32, f32)>,
    finals: Vec<(u32, f32)>,
    transitions: Vec<Transition>,
}

/// Immutable graph stored in CSR form, with a second index over incoming transitions for the
/// backward direction.
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    num_states: usize,
    initial: Vec<f32>,
    finals: Vec<f32>,

    // sorted by source state; transitions of state s are offsets[s]..offsets[s+1]
    offsets: Vec<u32>,
    transitions: Vec<Transition>,

    // transition ids sorted by destination state
    in_offsets: Vec<u32>,
    in_ids: Vec<u32>,
}

fn dense_weights(num_states: usize, sparse: &[(u32, f32)], what: &str) -> Result<Vec<f32>> {
    let mut dense = vec![f32::NEG_INFINITY; num_states];
    for &(state, weight) in sparse {
        let s = state as usize;
        if s >= num_states {
            bail!("{what} weight for state {state} but the graph has {num_states} states")
        }
        if weight.is_nan() || weight == f32::INFINITY {
            bail!("invalid {what} weight {weight} for state {state}")
        }
        if dense[s] != f32::NEG_INFINITY {
            bail!("duplicate {what} weight for state {state}")
        }
        dense[s] = weight;
    }
    if dense.iter().all(|&w| w == f32::NEG_INFINITY) {
        bail!("graph has no {what} state")
    }
    Ok(dense)
}

fn sparse_weights(dense: &[f32]) -> Vec<(u32, f32)> {
    dense
        .iter()
        .enumerate()
        .filter(|(_, w)| w.is_finite())
        .map(|(s, &w)| (s as u32, w))
        .collect()
}

impl Graph {
    /// Builds a graph from sparse initial/final log-weights and a transition list.
    ///
    /// States not listed in `initial` (resp. `finals`) get log-weight `-inf`. Transitions keep
    /// their relative order within each source state.
    pub fn new(
        num_states: usize,
        initial: &[(u32, f32)],
        finals: &[(u32, f32)],
        transitions: Vec<Transition>,
    ) -> Result<Self> {
        if num_states == 0 {
            bail!("graph has no states")
        }
        if num_states >= u32::MAX as usize || transitions.len() >= u32::MAX as usize {
            bail!("graph too large: {num_states} states, {} transitions", transitions.len())
        }
        let initial = dense_weights(num_states, initial, "initial")?;
        let finals = dense_weights(num_states, finals, "final")?;
        for tr in transitions.iter() {
            if tr.src as usize >= num_states || tr.dst as usize >= num_states {
                bail!("transition {tr:?} out of range for {num_states} states")
            }
            if !tr.log_prob.is_finite() {
                bail!("transition {tr:?} has a non-finite log-prob")
            }
        }

        let mut transitions = transitions;
        transitions.sort_by_key(|tr| tr.src);
        let mut offsets = vec![0u32; num_states + 1];
        let mut in_offsets = vec![0u32; num_states + 1];
        for tr in transitions.iter() {
            offsets[tr.src as usize + 1] += 1;
            in_offsets[tr.dst as usize + 1] += 1;
        }
        for s in 1..=num_states {
            offsets[s] += offsets[s - 1];
            in_offsets[s] += in_offsets[s - 1];
        }
        let mut in_ids: Vec<u32> = (0..transitions.len() as u32).collect();
        in_ids.sort_by_key(|&id| transitions[id as usize].dst);

        Ok(Self {
            num_states,
            initial,
            finals,
            offsets,
            transitions,
            in_offsets,
            in_ids,
        })
    }

    /// Same topology with a different initial distribution.
    pub fn with_initial(&self, initial: &[(u32, f32)]) -> Result<Self> {
        let initial = dense_weights(self.num_states, initial, "initial")?;
        Ok(Self {
            initial,
            ..self.clone()
        })
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    pub fn num_transitions(&self) -> usize {
        self.transitions.len()
    }

    /// All transitions, grouped by source state.
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Range of transition ids leaving `state`, indexing into [`Graph::transitions`].
    #[inline]
    pub fn transition_ids_from(&self, state: u32) -> std::ops::Range<usize> {
        let lo = self.offsets[state as usize] as usize;
        let hi = self.offsets[state as usize + 1] as usize;
        lo..hi
    }

    #[inline]
    pub fn transitions_from(&self, state: u32) -> &[Transition] {
        &self.transitions[self.transition_ids_from(state)]
    }

    /// Ids of the transitions entering `state`.
    #[inline]
    pub fn transition_ids_into(&self, state: u32) -> &[u32] {
        let lo = self.in_offsets[state as usize] as usize;
        let hi = self.in_offsets[state as usize + 1] as usize;
        &self.in_ids[lo..hi]
    }

    pub fn transitions_into(&self, state: u32) -> impl Iterator<Item = &Transition> + '_ {
        self.transition_ids_into(state)
            .iter()
            .map(move |&id| &self.transitions[id as usize])
    }

    #[inline]
    pub fn initial_log_prob(&self, state: u32) -> f32 {
        self.initial[state as usize]
    }

    #[inline]
    pub fn final_log_prob(&self, state: u32) -> f32 {
        self.finals[state as usize]
    }

    pub fn initial_log_probs(&self) -> &[f32] {
        &self.initial
    }

    pub fn final_log_probs(&self) -> &[f32] {
        &self.finals
    }

    pub fn max_pdf_id(&self) -> Option<u32> {
        self.transitions.iter().map(|tr| tr.pdf_id).max()
    }

    /// Checks that every state lies on some path from an initial state to a final state.
    pub fn check_connected(&self) -> Result<()> {
        let n = self.num_states;

        let mut accessible = vec![false; n];
        let mut queue: VecDeque<u32> = VecDeque::new();
        for s in 0..n {
            if self.initial[s] != f32::NEG_INFINITY {
                accessible[s] = true;
                queue.push_back(s as u32);
            }
        }
        while let Some(s) = queue.pop_front() {
            for tr in self.transitions_from(s) {
                if !accessible[tr.dst as usize] {
                    accessible[tr.dst as usize] = true;
                    queue.push_back(tr.dst);
                }
            }
        }

        let mut coaccessible = vec![false; n];
        for s in 0..n {
            if self.finals[s] != f32::NEG_INFINITY {
                coaccessible[s] = true;
                queue.push_back(s as u32);
            }
        }
        while let Some(s) = queue.pop_front() {
            for tr in self.transitions_into(s) {
                if !coaccessible[tr.src as usize] {
                    coaccessible[tr.src as usize] = true;
                    queue.push_back(tr.src);
                }
            }
        }

        if let Some(s) = (0..n).find(|&s| !accessible[s]) {
            bail!("state {s} is not reachable from an initial state")
        }
        if let Some(s) = (0..n).find(|&s| !coaccessible[s]) {
            bail!("state {s} cannot reach a final state")
        }
        Ok(())
    }

    fn to_def(&self) -> GraphDef {
        GraphDef {
            num_states: self.num_states,
            initial: sparse_weights(&self.initial),
            finals: sparse_weights(&self.finals),
            transitions: self.transitions.clone(),
        }
    }

    fn from_def(def: GraphDef) -> Result<Self> {
        Self::new(def.num_states, &def.initial, &def.finals, def.transitions)
    }

    /// Serializes the graph, either as little-endian binary or as one line of JSON.
    ///
    /// The output is canonical: writing a graph that was read back produces the same bytes.
    pub fn write<W: Write>(&self, w: &mut W, binary: bool) -> Result<()> {
        let def = self.to_def();
        if !binary {
            serde_json::to_writer(&mut *w, &def).map_err(Error::wrap)?;
            w.write_all(b"\n")?;
            return Ok(());
        }
        w.write_all(BINARY_MAGIC)?;
        write_u32(w, BINARY_VERSION)?;
        write_u32(w, def.num_states as u32)?;
        for weights in [&def.initial, &def.finals] {
            write_u32(w, weights.len() as u32)?;
            for &(s, weight) in weights.iter() {
                write_u32(w, s)?;
                w.write_all(&weight.to_le_bytes())?;
            }
        }
        write_u32(w, def.transitions.len() as u32)?;
        for tr in def.transitions.iter() {
            write_u32(w, tr.src)?;
            write_u32(w, tr.dst)?;
            write_u32(w, tr.pdf_id)?;
            w.write_all(&tr.log_prob.to_le_bytes())?;
        }
        Ok(())
    }

    /// Reads a graph written by [`Graph::write`] with the same `binary` flag.
    pub fn read<R: Read>(r: &mut R, binary: bool) -> Result<Self> {
        if !binary {
            let def: GraphDef = serde_json::from_reader(r).map_err(Error::wrap)?;
            return Self::from_def(def);
        }
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != BINARY_MAGIC {
            bail!("not a binary chain graph, magic {magic:?}")
        }
        let version = read_u32(r)?;
        if version != BINARY_VERSION {
            bail!("unsupported chain graph version {version}")
        }
        let num_states = read_u32(r)? as usize;
        let mut weights = Vec::with_capacity(2);
        for _ in 0..2 {
            let len = read_u32(r)? as usize;
            let mut sparse = Vec::with_capacity(len.min(num_states));
            for _ in 0..len {
                let s = read_u32(r)?;
                sparse.push((s, read_f32(r)?));
            }
            weights.push(sparse);
        }
        let num_transitions = read_u32(r)? as usize;
        let mut transitions = Vec::with_capacity(num_transitions.min(1 << 24));
        for _ in 0..num_transitions {
            let src = read_u32(r)?;
            let dst = read_u32(r)?;
            let pdf_id = read_u32(r)?;
            let log_prob = read_f32(r)?;
            transitions.push(Transition::new(src, dst, pdf_id, log_prob));
        }
        let finals = weights.pop().unwrap_or_default();
        let initial = weights.pop().unwrap_or_default();
        Self::from_def(GraphDef {
            num_states,
            initial,
            finals,
            transitions,
        })
    }

    /// Writes to `path`; `.json` files get the text format, anything else binary.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut w = std::io::BufWriter::new(std::fs::File::create(path)?);
        self.write(&mut w, !is_json(path))?;
        w.flush()?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut r = std::io::BufReader::new(std::fs::File::open(path)?);
        Self::read(&mut r, !is_json(path))
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut bytes = [0u8; 4];
    r.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_f32<R: Read>(r: &mut R) -> Result<f32> {
    let mut bytes = [0u8; 4];
    r.read_exact(&mut bytes)?;
    Ok(f32::from_le_bytes(bytes))
}
