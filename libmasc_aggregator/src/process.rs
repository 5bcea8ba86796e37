use std::fs::File;
use std::io::BufWriter;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;

use super::config::Config;
use super::error::{ProcessorError, RecordError, WriterError};
use super::ingest::{read_particles, RawParticle};
use super::ordered_writer::OrderedWriter;
use super::particle::{ParticleAggregator, ParticleRecord};
use super::qc_bits::{legend, ImageQcFlag, ParticleQcFlag, TimeBinQcFlag};
use super::quality::ImageQualityGate;
use super::record_format::{
    image_rows, images_header, particle_row, particles_header, time_bin_row, time_bins_header,
};
use super::time_bin::TimeBinAggregator;
use super::worker_status::{Phase, WorkerStatus};

pub type TableWriter = OrderedWriter<BufWriter<File>>;

/// Everything a worker needs. Shared read-only between workers; the writers are the only state
/// that changes, and they synchronize internally.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub config: Arc<Config>,
    pub input: Arc<Vec<RawParticle>>,
    pub images: Arc<TableWriter>,
    pub particles: Arc<TableWriter>,
}

impl WorkerContext {
    fn n_chunks(&self) -> usize {
        self.input.len().div_ceil(self.config.particles_per_chunk)
    }

    fn chunk(&self, chunk_index: usize) -> &[RawParticle] {
        let size = self.config.particles_per_chunk;
        let start = (chunk_index * size).min(self.input.len());
        let stop = (start + size).min(self.input.len());
        &self.input[start..stop]
    }
}

/// Totals from a completed run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub particles_read: usize,
    pub particles_aggregated: usize,
    pub time_bins: usize,
    /// Indices missing from any of the output tables
    pub writer_gaps: usize,
}

/// Gate and aggregate one chunk, rendering its image and particle rows
fn process_chunk(
    chunk: &[RawParticle],
    config: &Config,
    gate: &ImageQualityGate,
    aggregator: &ParticleAggregator,
) -> Result<(Vec<ParticleRecord>, String, String), RecordError> {
    let mut records = Vec::with_capacity(chunk.len());
    let mut image_payload = String::new();
    let mut particle_payload = String::new();
    for raw in chunk {
        let record = ParticleRecord::from_features(
            raw.particle_id,
            raw.captured_at,
            raw.fall_speed_mps,
            raw.images.clone(),
            gate,
            aggregator,
        );
        image_payload.push_str(&image_rows(&record, config)?);
        particle_payload.push_str(&particle_row(&record, config)?);
        records.push(record);
    }
    Ok((records, image_payload, particle_payload))
}

/// Process a subset of chunks. Returns the aggregated particles of each chunk with its index
pub fn process_subset(
    context: WorkerContext,
    tx: Sender<WorkerStatus>,
    worker_id: usize,
    subset: Vec<usize>,
) -> Result<ChunkResults, ProcessorError> {
    let config = &context.config;
    let gate = ImageQualityGate::new(config.image_quality.clone());
    let aggregator = ParticleAggregator::new(config.num_cameras);
    let mut results = Vec::with_capacity(subset.len());

    tx.send(WorkerStatus::new(0.0, worker_id, Phase::Particles))?;
    for (done, chunk_index) in subset.iter().enumerate() {
        let chunk = context.chunk(*chunk_index);
        match process_chunk(chunk, config, &gate, &aggregator) {
            Ok((records, image_payload, particle_payload)) => {
                submit_or_log(&context.images, *chunk_index, image_payload, "images");
                submit_or_log(&context.particles, *chunk_index, particle_payload, "particles");
                results.push((*chunk_index, records));
            }
            Err(e) => {
                // Keep the index so the writers don't see a gap
                spdlog::error!("Worker {worker_id} failed on chunk {chunk_index}: {e}");
                let comment = format!("# chunk {chunk_index} failed: {e}\n");
                submit_or_log(&context.images, *chunk_index, comment.clone(), "images");
                submit_or_log(&context.particles, *chunk_index, comment, "particles");
                results.push((*chunk_index, Vec::new()));
            }
        }
        tx.send(WorkerStatus::new(
            (done + 1) as f32 / subset.len() as f32,
            worker_id,
            Phase::Particles,
        ))?;
    }
    Ok(results)
}

/// A rejected submission leaves a gap which `finish` reports. The worker moves on to its next chunk
fn submit_or_log(writer: &TableWriter, chunk_index: usize, payload: String, name: &str) {
    if let Err(e) = writer.submit(chunk_index, payload) {
        spdlog::error!("Could not submit chunk {chunk_index} to the {name} table: {e}");
    }
}

/// Deal chunk indices out to the workers round-robin
pub fn create_subsets(n_chunks: usize, n_threads: usize) -> Vec<Vec<usize>> {
    let mut subsets: Vec<Vec<usize>> = vec![Vec::new(); n_threads.max(1)];
    let n_subsets = subsets.len();

    for chunk_index in 0..n_chunks {
        subsets[chunk_index % n_subsets].push(chunk_index)
    }

    subsets
}

fn open_writer(
    path: std::path::PathBuf,
    header: &str,
    config: &Config,
) -> Result<TableWriter, ProcessorError> {
    let file = File::create(&path)?;
    spdlog::info!("Writing {}", path.display());
    Ok(OrderedWriter::new(
        BufWriter::new(file),
        Some(header),
        &config.writer,
    )?)
}

type ChunkResults = Vec<(usize, Vec<ParticleRecord>)>;

/// Join every worker, even after one has failed, so nothing is still submitting when the writers
/// are closed. Returns the chunks of the workers which finished and the first failure.
fn join_workers(
    workers: Vec<(usize, JoinHandle<Result<ChunkResults, ProcessorError>>)>,
) -> (ChunkResults, Option<ProcessorError>) {
    let mut chunks = ChunkResults::new();
    let mut first_error = None;
    for (idx, worker) in workers {
        let error = match worker.join() {
            Ok(Ok(result)) => {
                chunks.extend(result);
                continue;
            }
            Ok(Err(e)) => e,
            Err(_) => ProcessorError::WorkerPanicked(idx),
        };
        spdlog::error!("Worker {idx} stopped early: {error}");
        first_error.get_or_insert(error);
    }
    (chunks, first_error)
}

/// Write out anything buffered, then release the file. Returns the number of missing indices
fn close_writer(
    writer: Arc<TableWriter>,
    expected_count: usize,
    name: &str,
) -> Result<usize, ProcessorError> {
    let gaps = writer.finish(Some(expected_count))?;
    if !gaps.is_empty() {
        spdlog::warn!("{name} table is missing {} payloads: {gaps:?}", gaps.len());
    }
    spdlog::info!("Wrote {} payloads to the {name} table", writer.written()?);
    let writer = Arc::try_unwrap(writer).map_err(|_| WriterError::StillShared)?;
    writer
        .into_inner()?
        .into_inner()
        .map_err(|e| e.into_error())?;
    Ok(gaps.len())
}

/// The main loop of masc_aggregator.
///
/// Reads the input, runs the gate and particle aggregation on `n_threads` workers, bins the
/// particles in time and writes the three output tables.
pub fn process(config: Config, tx: Sender<WorkerStatus>) -> Result<RunSummary, ProcessorError> {
    config.validate()?;
    let input = read_particles(&config.input_path, &config.delimiter, config.num_cameras)?;
    spdlog::info!("Loaded {} particles", input.len());
    spdlog::info!("Image QC bits: {}", legend::<ImageQcFlag>());
    spdlog::info!("Particle QC bits: {}", legend::<ParticleQcFlag>());
    spdlog::info!("Time bin QC bits: {}", legend::<TimeBinQcFlag>());

    let images = Arc::new(open_writer(
        config.get_images_file()?,
        &images_header(&config.delimiter),
        &config,
    )?);
    let particles = Arc::new(open_writer(
        config.get_particles_file()?,
        &particles_header(&config.delimiter),
        &config,
    )?);
    let bins_writer = open_writer(
        config.get_time_bins_file()?,
        &time_bins_header(&config.delimiter),
        &config,
    )?;

    let context = WorkerContext {
        config: Arc::new(config),
        input: Arc::new(input),
        images,
        particles,
    };
    let n_chunks = context.n_chunks();
    let subsets = create_subsets(n_chunks, context.config.n_threads);
    spdlog::info!(
        "Dispatching {n_chunks} chunks of up to {} particles to {} workers",
        context.config.particles_per_chunk,
        subsets.iter().filter(|s| !s.is_empty()).count()
    );

    let mut workers = Vec::new();
    for (idx, subset) in subsets.into_iter().enumerate() {
        // Dont make empty workers
        if subset.is_empty() {
            continue;
        }
        let worker_context = context.clone();
        let worker_tx = tx.clone();
        workers.push((
            idx,
            std::thread::spawn(move || process_subset(worker_context, worker_tx, idx, subset)),
        ));
    }

    let (mut chunks, worker_error) = join_workers(workers);

    let WorkerContext {
        config,
        input,
        images,
        particles,
    } = context;
    let mut summary = RunSummary {
        particles_read: input.len(),
        ..Default::default()
    };
    drop(input);
    // Flush what the writers hold even when a worker failed
    let images_closed = close_writer(images, n_chunks, "images");
    let particles_closed = close_writer(particles, n_chunks, "particles");
    if let Some(e) = worker_error {
        return Err(e);
    }
    summary.writer_gaps += images_closed?;
    summary.writer_gaps += particles_closed?;

    // Restore input order, then order by time. The sort is stable so equal times keep input order
    chunks.sort_by_key(|(chunk_index, _)| *chunk_index);
    let mut records: Vec<ParticleRecord> = chunks.into_iter().flat_map(|(_, r)| r).collect();
    records.sort_by_key(|r| r.captured_at);
    summary.particles_aggregated = records
        .iter()
        .filter(|r| r.aggregation.is_built_from_average())
        .count();
    spdlog::info!(
        "Aggregated {} of {} particles",
        summary.particles_aggregated,
        summary.particles_read
    );

    let binner = TimeBinAggregator::new(&config.time_binning);
    let bins = binner.aggregate(&records);
    summary.time_bins = bins.len();
    spdlog::info!(
        "Generated {} time bins of width {}",
        bins.len(),
        config.time_binning.bin_width
    );

    let bins_writer = Arc::new(bins_writer);
    let flush_val = (bins.len() / 100).max(1);
    tx.send(WorkerStatus::new(0.0, 0, Phase::TimeBins))?;
    for (idx, bin) in bins.iter().enumerate() {
        let payload = match time_bin_row(bin, &config) {
            Ok(row) => row,
            Err(e) => {
                spdlog::error!("Failed to format time bin {idx}: {e}");
                format!("# time bin {idx} failed: {e}\n")
            }
        };
        bins_writer.submit(idx, payload)?;
        if (idx + 1) % flush_val == 0 {
            tx.send(WorkerStatus::new(
                (idx + 1) as f32 / bins.len() as f32,
                0,
                Phase::TimeBins,
            ))?;
        }
    }
    summary.writer_gaps += close_writer(bins_writer, bins.len(), "time bins")?;
    tx.send(WorkerStatus::new(1.0, 0, Phase::TimeBins))?;

    spdlog::info!("Done processing {}", config.input_path.display());
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::ImageFeatureSet;
    use crate::record_format::{format_date, format_time, MEASUREMENT_COLUMNS};
    use crate::test_support::passing_image;
    use std::sync::mpsc;
    use time::macros::datetime;
    use time::PrimitiveDateTime;

    fn input_row(particle_id: u64, at: PrimitiveDateTime, camera_id: u8) -> String {
        let image = passing_image();
        let mut columns = vec![
            particle_id.to_string(),
            format_date(at).expect("date"),
            format_time(at).expect("time"),
            String::from("1.5"),
            camera_id.to_string(),
            String::from("1"),
        ];
        columns.extend(
            image
                .measurements()
                .iter()
                .map(|m| m.map(|v| v.to_string()).unwrap_or(String::from("-9999"))),
        );
        columns.join("\t")
    }

    fn write_input(path: &std::path::Path, particles: &[(u64, PrimitiveDateTime)]) {
        let mut lines = vec![format!(
            "particle_id\tdate\ttime\tfall_speed_mps\tcamera_id\tnum_objects\t{}",
            MEASUREMENT_COLUMNS.join("\t")
        )];
        for (id, at) in particles {
            for camera in 0..3 {
                lines.push(input_row(*id, *at, camera));
            }
        }
        std::fs::write(path, lines.join("\n")).expect("write input");
    }

    #[test]
    fn test_create_subsets_round_robin() {
        assert_eq!(
            create_subsets(5, 2),
            vec![vec![0, 2, 4], vec![1, 3]]
        );
        assert_eq!(create_subsets(1, 3), vec![vec![0], vec![], vec![]]);
    }

    #[test]
    fn test_end_to_end_run() {
        let dir = tempfile::tempdir().expect("temp dir");
        let input_path = dir.path().join("input.tsv");
        let mut particles: Vec<(u64, PrimitiveDateTime)> = (0..25)
            .map(|i| (i, datetime!(2015-10-28 22:00:00) + time::Duration::seconds(i as i64 * 61)))
            .collect();
        // Out of order in the input; binning must still see them sorted
        particles.swap(3, 20);
        write_input(&input_path, &particles);

        let config = Config {
            input_path,
            output_path: dir.path().to_path_buf(),
            n_threads: 3,
            particles_per_chunk: 4,
            ..Default::default()
        };
        let (tx, rx) = mpsc::channel();
        let summary = process(config.clone(), tx).expect("run succeeds");
        assert_eq!(
            summary,
            RunSummary {
                particles_read: 25,
                particles_aggregated: 25,
                time_bins: 12,
                writer_gaps: 0,
            }
        );
        let statuses: Vec<WorkerStatus> = rx.try_iter().collect();
        assert!(statuses
            .iter()
            .any(|s| s.phase == Phase::TimeBins && s.progress == 1.0));

        let particle_table =
            std::fs::read_to_string(config.get_particles_file().expect("path")).expect("read");
        let ids: Vec<u64> = particle_table
            .lines()
            .skip(1)
            .map(|l| l.split('\t').next().expect("id").parse().expect("numeric id"))
            .collect();
        let expected: Vec<u64> = particles.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, expected);

        let image_table =
            std::fs::read_to_string(config.get_images_file().expect("path")).expect("read");
        assert_eq!(image_table.lines().count(), 1 + 25 * 3);

        let bin_table =
            std::fs::read_to_string(config.get_time_bins_file().expect("path")).expect("read");
        let rows: Vec<&str> = bin_table.lines().skip(1).collect();
        assert_eq!(rows.len(), 12);
        let totals: usize = rows
            .iter()
            .map(|r| r.split('\t').nth(3).expect("total").parse::<usize>().expect("count"))
            .sum();
        assert_eq!(totals, 25);
    }

    #[test]
    fn test_bad_config_fails_fast() {
        let config = Config {
            n_threads: 0,
            ..Default::default()
        };
        let (tx, _rx) = mpsc::channel();
        assert!(matches!(
            process(config, tx),
            Err(ProcessorError::ConfigError(_))
        ));
    }

    fn raw_particle(particle_id: u64, at: PrimitiveDateTime) -> RawParticle {
        let image = ImageFeatureSet {
            captured_at: at,
            ..passing_image()
        };
        RawParticle {
            particle_id,
            captured_at: at,
            fall_speed_mps: Some(1.5),
            images: vec![image.clone(), image.clone(), image],
        }
    }

    #[test]
    fn test_rejected_submit_does_not_stop_worker() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = Config {
            output_path: dir.path().to_path_buf(),
            particles_per_chunk: 1,
            ..Default::default()
        };
        let images = Arc::new(
            open_writer(config.get_images_file().expect("path"), "header\n", &config)
                .expect("writer"),
        );
        let particles = Arc::new(
            open_writer(config.get_particles_file().expect("path"), "header\n", &config)
                .expect("writer"),
        );
        // Chunk 0 is already taken, so the worker's own submission for it is refused
        images
            .submit(0, String::from("# taken\n"))
            .expect("submit");

        let at = datetime!(2015-10-28 22:00:00);
        let context = WorkerContext {
            config: Arc::new(config.clone()),
            input: Arc::new((0..3).map(|i| raw_particle(i, at)).collect()),
            images: Arc::clone(&images),
            particles: Arc::clone(&particles),
        };
        let (tx, _rx) = mpsc::channel();
        let results = process_subset(context, tx, 0, vec![0, 1, 2]).expect("worker runs");
        assert_eq!(results.len(), 3);

        assert_eq!(close_writer(images, 3, "images").expect("close"), 0);
        assert_eq!(close_writer(particles, 3, "particles").expect("close"), 0);
        let image_table =
            std::fs::read_to_string(config.get_images_file().expect("path")).expect("read");
        let lines: Vec<&str> = image_table.lines().collect();
        assert_eq!(lines.len(), 2 + 2 * 3);
        assert_eq!(lines[1], "# taken");
        let particle_table =
            std::fs::read_to_string(config.get_particles_file().expect("path")).expect("read");
        assert_eq!(particle_table.lines().count(), 1 + 3);
    }

    #[test]
    fn test_join_workers_waits_for_all() {
        let finished = std::thread::spawn(|| -> Result<ChunkResults, ProcessorError> {
            Ok(vec![(0, Vec::new())])
        });
        let failed = std::thread::spawn(|| -> Result<ChunkResults, ProcessorError> {
            Err(ProcessorError::WriterError(WriterError::Poisoned))
        });
        let slow = std::thread::spawn(|| -> Result<ChunkResults, ProcessorError> {
            std::thread::sleep(std::time::Duration::from_millis(50));
            Ok(vec![(2, Vec::new()), (5, Vec::new())])
        });
        let panicked = std::thread::spawn(|| -> Result<ChunkResults, ProcessorError> {
            panic!("worker failed")
        });

        let (chunks, error) =
            join_workers(vec![(0, finished), (1, failed), (2, slow), (3, panicked)]);
        let indices: Vec<usize> = chunks.iter().map(|(idx, _)| *idx).collect();
        assert_eq!(indices, vec![0, 2, 5]);
        assert!(matches!(
            error,
            Some(ProcessorError::WriterError(WriterError::Poisoned))
        ));
    }

    #[test]
    fn test_failed_workers_still_close_tables() {
        let dir = tempfile::tempdir().expect("temp dir");
        let input_path = dir.path().join("input.tsv");
        let at = datetime!(2015-10-28 22:00:00);
        write_input(&input_path, &[(0, at), (1, at)]);
        let config = Config {
            input_path,
            output_path: dir.path().to_path_buf(),
            n_threads: 2,
            particles_per_chunk: 1,
            ..Default::default()
        };
        // Nobody listens for progress, so every worker fails on its first status message
        let (tx, rx) = mpsc::channel();
        drop(rx);
        assert!(matches!(
            process(config.clone(), tx),
            Err(ProcessorError::SendError(_))
        ));
        for path in [config.get_images_file(), config.get_particles_file()] {
            let table = std::fs::read_to_string(path.expect("path")).expect("read");
            assert_eq!(table.lines().count(), 1);
        }
    }

    #[test]
    fn test_blank_features_still_get_rows() {
        let config = Config::default();
        let gate = ImageQualityGate::new(config.image_quality.clone());
        let aggregator = ParticleAggregator::new(config.num_cameras);
        let raw = RawParticle {
            particle_id: 9,
            captured_at: datetime!(2015-10-28 22:00:00),
            fall_speed_mps: None,
            images: vec![ImageFeatureSet::empty(None, datetime!(2015-10-28 22:00:00))],
        };
        let (records, images, particles) =
            process_chunk(&[raw], &config, &gate, &aggregator).expect("chunk");
        assert_eq!(records.len(), 1);
        assert_eq!(images.lines().count(), 1);
        assert_eq!(particles.lines().count(), 1);
    }
}
