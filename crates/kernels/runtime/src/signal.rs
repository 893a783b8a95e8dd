//! Receiver signal accumulation and the on-disk signal format.
//!
//! Each receive channel owns one [`SignalRecord`] per global sample index.
//! A spin adds its coil-weighted magnetization to every record exactly
//! once; partial sets from different workers are combined by
//! [`crate::reductions::reduce_signal_sets`].
//!
//! # File format
//!
//! `signal_<NN>.bin` per channel, `NN` the zero-padded channel index.
//! Records follow each other in sample order without a header:
//!
//! ```text
//! offset  0  time  f64 LE
//! offset  8  mx    f64 LE
//! offset 16  my    f64 LE
//! offset 24  mz    f64 LE
//! ```

use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use larmor_foundation::RngStream;

use crate::coil::ReceiveCoil;
use crate::walker::{EmittedSample, SampleSink};

/// One accumulated sample of one channel.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub time: f64,
    pub mx: f64,
    pub my: f64,
    pub mz: f64,
}

impl SignalRecord {
    /// Encoded size in bytes.
    pub const SIZE: usize = 32;

    pub fn at(time: f64) -> Self {
        Self {
            time,
            ..Default::default()
        }
    }

    pub fn to_le_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        for (chunk, value) in out
            .chunks_exact_mut(8)
            .zip([self.time, self.mx, self.my, self.mz])
        {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn from_le_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut fields = [0.0f64; 4];
        for (field, chunk) in fields.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *field = f64::from_le_bytes(raw);
        }
        let [time, mx, my, mz] = fields;
        Self { time, mx, my, mz }
    }

    /// Add another record's magnetization; the time stays.
    #[inline]
    pub fn accumulate(&mut self, other: &SignalRecord) {
        self.mx += other.mx;
        self.my += other.my;
        self.mz += other.mz;
    }
}

/// Per-channel signal, indexed by global sample index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSet {
    channels: Vec<Vec<SignalRecord>>,
}

impl SignalSet {
    /// Zero signal on `channels` channels at the given sample times.
    pub fn with_timeline(channels: usize, times: &[f64]) -> Self {
        let template: Vec<SignalRecord> = times.iter().map(|&t| SignalRecord::at(t)).collect();
        Self {
            channels: vec![template; channels],
        }
    }

    pub fn from_channels(channels: Vec<Vec<SignalRecord>>) -> Self {
        Self { channels }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn sample_count(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn channel(&self, index: usize) -> &[SignalRecord] {
        &self.channels[index]
    }

    pub fn channels(&self) -> &[Vec<SignalRecord>] {
        &self.channels
    }

    pub fn into_channels(self) -> Vec<Vec<SignalRecord>> {
        self.channels
    }

    /// Add one spin's contribution to sample `index` of `channel`.
    #[inline]
    pub fn add(&mut self, channel: usize, index: usize, m: [f64; 3]) {
        let record = &mut self.channels[channel][index];
        record.mx += m[0];
        record.my += m[1];
        record.mz += m[2];
    }

    /// Add every record of a compatible set into this one.
    pub fn accumulate(&mut self, other: &SignalSet) {
        debug_assert!(self.is_compatible(other));
        for (mine, theirs) in self.channels.iter_mut().zip(&other.channels) {
            for (record, add) in mine.iter_mut().zip(theirs) {
                record.accumulate(add);
            }
        }
    }

    /// Same shape as `other`: channel count and sample count both agree.
    pub fn is_compatible(&self, other: &SignalSet) -> bool {
        self.channels.len() == other.channels.len()
            && self
                .channels
                .iter()
                .zip(&other.channels)
                .all(|(a, b)| a.len() == b.len())
    }

    /// Divide every magnetization component by `spins`.
    pub fn normalize(&mut self, spins: usize) {
        if spins == 0 {
            return;
        }
        let scale = 1.0 / spins as f64;
        for record in self.channels.iter_mut().flatten() {
            record.mx *= scale;
            record.my *= scale;
            record.mz *= scale;
        }
    }

    /// Add dwell-time weighted Gaussian noise to the transverse components.
    ///
    /// `level` is the standard deviation at a dwell time of 0.01 ms; the
    /// deviation scales with `1/sqrt(dwell)`, the dwell of a sample being
    /// its distance to the previous sample (or the next one for the first).
    pub fn add_noise(&mut self, level: f64, seed: u64) {
        if level <= 0.0 {
            return;
        }
        let base = RngStream::derive(seed, "receiver.noise");
        for (c, records) in self.channels.iter_mut().enumerate() {
            let mut rng = base.substream(&format!("channel.{c}"));
            let times: Vec<f64> = records.iter().map(|r| r.time).collect();
            for (i, record) in records.iter_mut().enumerate() {
                let dwell = dwell_time(&times, i);
                let sigma = level * 0.1 / dwell.sqrt();
                record.mx += rng.normal() * sigma;
                record.my += rng.normal() * sigma;
            }
        }
    }

    /// Write `signal_<NN>.bin` for every channel into `dir`.
    pub fn write_to_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        fs::create_dir_all(dir)?;
        self.channels
            .iter()
            .enumerate()
            .map(|(c, records)| {
                let path = dir.join(channel_file_name(c));
                write_records(&path, records)?;
                Ok(path)
            })
            .collect()
    }
}

/// Projects buffered spin samples through every coil into a signal set.
///
/// For coil sensitivity `s * exp(i phi)` and receiver phase `psi` the
/// transverse part is rotated by `phi - psi`; `Mz` is weighted by `s` only.
pub struct CoilReceiver<'a> {
    coils: &'a [Box<dyn ReceiveCoil>],
    signal: &'a mut SignalSet,
}

impl<'a> CoilReceiver<'a> {
    pub fn new(coils: &'a [Box<dyn ReceiveCoil>], signal: &'a mut SignalSet) -> Self {
        debug_assert_eq!(coils.len(), signal.channel_count());
        Self { coils, signal }
    }
}

impl SampleSink for CoilReceiver<'_> {
    fn accept(&mut self, sample: &EmittedSample) {
        let [mx, my, mz] = sample.magnetization;
        let transverse = mx.hypot(my);
        let index = sample.request.sample_index as usize;
        for (channel, coil) in self.coils.iter().enumerate() {
            let (magnitude, phase) = coil.sensitivity(sample.position);
            let angle = my.atan2(mx) + phase - sample.request.receiver_phase;
            self.signal.add(
                channel,
                index,
                [
                    magnitude * transverse * angle.cos(),
                    magnitude * transverse * angle.sin(),
                    magnitude * mz,
                ],
            );
        }
    }
}

fn dwell_time(times: &[f64], i: usize) -> f64 {
    let dt = if i > 0 {
        times[i] - times[i - 1]
    } else if times.len() > 1 {
        times[1] - times[0]
    } else {
        1.0
    };
    if dt > 0.0 { dt } else { 1.0 }
}

pub fn channel_file_name(channel: usize) -> String {
    format!("signal_{channel:02}.bin")
}

pub fn write_records(path: &Path, records: &[SignalRecord]) -> io::Result<()> {
    let mut writer = BufWriter::new(fs::File::create(path)?);
    for record in records {
        writer.write_all(&record.to_le_bytes())?;
    }
    writer.flush()
}

pub fn read_records(path: &Path) -> io::Result<Vec<SignalRecord>> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    if bytes.len() % SignalRecord::SIZE != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "{} is {} bytes, not a multiple of {}",
                path.display(),
                bytes.len(),
                SignalRecord::SIZE
            ),
        ));
    }
    Ok(bytes
        .chunks_exact(SignalRecord::SIZE)
        .map(|chunk| {
            let mut raw = [0u8; SignalRecord::SIZE];
            raw.copy_from_slice(chunk);
            SignalRecord::from_le_bytes(&raw)
        })
        .collect())
}
