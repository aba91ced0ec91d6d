/// Offline utterance segmentation
/// Runs a WAV file through the call VAD and segmenter in 20 ms chunks and
/// prints each utterance's silence report as JSON.
///
/// Usage: segment_wav <input.wav> [output_dir] [energy|webrtc]
use anyhow::Context;
use rholine::audio::{decode_wav, i16_slice_to_u8, save_wav, u8_to_i16_slice};
use rholine::segment::Segmenter;
use rholine::vad::{build_detector, VadEngine, VadParams};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::time::{Duration, Instant};

const SAMPLE_RATE: u32 = 16_000;
const CHUNK_MS: u64 = 20;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(input) = args.get(1) else {
        anyhow::bail!("usage: {} <input.wav> [output_dir] [energy|webrtc]", args[0]);
    };
    let output_dir = args.get(2).map(PathBuf::from);
    let engine: VadEngine = match args.get(3) {
        Some(name) => name.parse()?,
        None => VadEngine::default(),
    };

    let file = File::open(input).with_context(|| format!("opening {}", input))?;
    let samples = decode_wav(BufReader::new(file), SAMPLE_RATE)?;
    let params = VadParams {
        stop_secs: 0.6,
        ..VadParams::default()
    };
    let mut vad = build_detector(engine, params, 0.02, SAMPLE_RATE)?;
    let mut segmenter = Segmenter::new(SAMPLE_RATE);

    if let Some(dir) = &output_dir {
        std::fs::create_dir_all(dir)?;
    }

    // Trailing silence long enough to close a segment still open at EOF.
    let chunk_samples = (SAMPLE_RATE as u64 * CHUNK_MS / 1000) as usize;
    let flush_chunks = ((params.stop_secs + params.start_secs) * 1000.0) as usize / CHUNK_MS as usize + 2;
    let silence = vec![0i16; chunk_samples * flush_chunks];

    let start = Instant::now();
    let mut count = 0;
    for (i, chunk) in samples.chunks(chunk_samples).chain(silence.chunks(chunk_samples)).enumerate() {
        let pcm = i16_slice_to_u8(chunk);
        let now = start + Duration::from_millis(i as u64 * CHUNK_MS);
        let state = vad.analyze(&pcm);
        let Some(utterance) = segmenter.push(&pcm, state, now) else {
            continue;
        };

        count += 1;
        println!("{}", serde_json::to_string(&utterance.report)?);

        if let Some(dir) = &output_dir {
            let path = dir.join(format!("segment_{:03}_{:.1}s.wav", count, utterance.duration_secs()));
            save_wav(&path, &u8_to_i16_slice(&utterance.audio), SAMPLE_RATE)?;
            eprintln!("Saved {}", path.display());
        }
    }

    eprintln!("{} segment(s) found in {}", count, input);
    Ok(())
}
