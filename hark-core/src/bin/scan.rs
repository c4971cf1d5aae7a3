#[cfg(not(feature = "onnx"))]
fn main() {
    eprintln!("hark-scan requires the 'onnx' feature");
    std::process::exit(1);
}

#[cfg(feature = "onnx")]
fn main() {
    if let Err(e) = run() {
        eprintln!("scan failed: {e}");
        std::process::exit(1);
    }
}

/// Run the wake detector over WAV recordings and print a JSON report.
#[cfg(feature = "onnx")]
fn run() -> Result<(), String> {
    use hark_core::{
        audio::resample::RateConverter,
        buffering::f32_to_i16,
        wake::artifacts::selected_models_dir,
        DetectorConfig, ModelArtifacts, OnnxEngineFactory, WakeWordDetector,
    };
    use serde::Serialize;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Instant;

    #[derive(Debug)]
    struct Args {
        input: PathBuf,
        models_dir: PathBuf,
        custom: bool,
        threshold: Option<f32>,
        output: Option<PathBuf>,
    }

    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Detection {
        frame_index: usize,
        offset_secs: f64,
        score: f32,
    }

    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "camelCase")]
    struct FileReport {
        file: String,
        duration_secs: f64,
        frames: usize,
        max_score: f32,
        detections: Vec<Detection>,
    }

    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Summary {
        models_dir: String,
        threshold: f32,
        total_files: usize,
        total_frames: usize,
        total_detections: usize,
        p50_frame_ms: f64,
        p95_frame_ms: f64,
        files: Vec<FileReport>,
    }

    fn parse_args() -> Result<Args, String> {
        let mut input: Option<PathBuf> = None;
        let mut models_dir: Option<PathBuf> = None;
        let mut custom = false;
        let mut threshold = None;
        let mut output = None;

        let mut it = std::env::args().skip(1);
        while let Some(arg) = it.next() {
            let mut value = |name: &str| it.next().ok_or(format!("missing value for {name}"));
            match arg.as_str() {
                "--input" => input = Some(PathBuf::from(value("--input")?)),
                "--models" => models_dir = Some(PathBuf::from(value("--models")?)),
                "--output" => output = Some(PathBuf::from(value("--output")?)),
                "--threshold" => {
                    let v = value("--threshold")?;
                    threshold = Some(
                        v.parse::<f32>()
                            .map_err(|_| format!("invalid value for --threshold: {v}"))?
                            .clamp(0.0, 1.0),
                    );
                }
                "--custom" => custom = true,
                "--help" | "-h" => {
                    println!(
                        "Usage: cargo run -p hark-core --features onnx --bin hark-scan -- \\
  --input <file.wav|dir> [--models <dir>] [--custom] [--threshold <0..1>] [--output <file.json>]"
                    );
                    std::process::exit(0);
                }
                other => return Err(format!("unknown argument: {other}")),
            }
        }

        Ok(Args {
            input: input.ok_or("--input is required")?,
            models_dir: models_dir.unwrap_or_else(selected_models_dir),
            custom,
            threshold,
            output,
        })
    }

    fn collect_wavs(path: &Path, out: &mut Vec<PathBuf>) -> Result<(), String> {
        if path.is_file() {
            out.push(path.to_path_buf());
            return Ok(());
        }
        let entries = std::fs::read_dir(path).map_err(|e| e.to_string())?;
        for entry in entries {
            let path = entry.map_err(|e| e.to_string())?.path();
            if path.is_dir() {
                collect_wavs(&path, out)?;
            } else if path
                .extension()
                .and_then(|s| s.to_str())
                .is_some_and(|s| s.eq_ignore_ascii_case("wav"))
            {
                out.push(path);
            }
        }
        Ok(())
    }

    fn read_wav_mono_f32(path: &Path) -> Result<(Vec<f32>, u32), String> {
        let mut reader = hound::WavReader::open(path).map_err(|e| e.to_string())?;
        let spec = reader.spec();
        let channels = usize::from(spec.channels.max(1));

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?,
            hound::SampleFormat::Int if spec.bits_per_sample <= 16 => reader
                .samples::<i16>()
                .map(|s| s.map(|v| f32::from(v) / 32768.0))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?,
            hound::SampleFormat::Int => {
                let max = ((1_i64 << (spec.bits_per_sample - 1)) - 1) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / max))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| e.to_string())?
            }
        };

        let mut mono = Vec::with_capacity(interleaved.len() / channels);
        hark_core::audio::downmix_into(&interleaved, channels, &mut mono, |s| s);
        Ok((mono, spec.sample_rate))
    }

    fn percentile(values: &[f64], p: f64) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    let args = parse_args()?;
    let mut files = Vec::new();
    collect_wavs(&args.input, &mut files)?;
    files.sort();
    if files.is_empty() {
        return Err(format!("no .wav files under {}", args.input.display()));
    }

    let mut config = DetectorConfig::default();
    if let Some(t) = args.threshold {
        config.threshold = t;
    }
    let artifacts = if args.custom {
        ModelArtifacts::custom(&args.models_dir)
    } else {
        ModelArtifacts::openwakeword(&args.models_dir)
    };
    let detector = WakeWordDetector::new(
        config.clone(),
        artifacts,
        Arc::new(OnnxEngineFactory),
        None,
    )
    .map_err(|e| e.to_string())?;

    let mut latencies = Vec::new();
    let mut reports = Vec::with_capacity(files.len());

    for file in &files {
        // Fresh feature history per recording.
        detector.destroy();
        detector.load_blocking().map_err(|e| e.to_string())?;

        let (samples, rate) = read_wav_mono_f32(file)?;
        let mut converter = RateConverter::new(rate, config.sample_rate, 960)
            .map_err(|e| e.to_string())?;
        let pcm = f32_to_i16(&converter.process(&samples));

        let mut report = FileReport {
            file: file.display().to_string(),
            duration_secs: samples.len() as f64 / f64::from(rate.max(1)),
            frames: 0,
            max_score: 0.0,
            detections: Vec::new(),
        };

        let frame_secs = config.frame_size as f64 / f64::from(config.sample_rate);
        for (i, frame) in pcm.chunks_exact(config.frame_size).enumerate() {
            let started = Instant::now();
            let scored = detector
                .process_frame_scored(frame)
                .map_err(|e| e.to_string())?;
            latencies.push(started.elapsed().as_secs_f64() * 1000.0);

            report.frames += 1;
            report.max_score = report.max_score.max(scored.score);
            if scored.detected {
                report.detections.push(Detection {
                    frame_index: i,
                    offset_secs: (i + 1) as f64 * frame_secs,
                    score: scored.score,
                });
            }
        }
        reports.push(report);
    }

    let summary = Summary {
        models_dir: args.models_dir.display().to_string(),
        threshold: config.threshold,
        total_files: reports.len(),
        total_frames: reports.iter().map(|r| r.frames).sum(),
        total_detections: reports.iter().map(|r| r.detections.len()).sum(),
        p50_frame_ms: percentile(&latencies, 0.50),
        p95_frame_ms: percentile(&latencies, 0.95),
        files: reports,
    };

    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    match args.output {
        Some(path) => std::fs::write(&path, json).map_err(|e| e.to_string())?,
        None => println!("{json}"),
    }
    Ok(())
}
