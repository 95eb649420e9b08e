use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::Result;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::Level;

use super::command::{AudioFormat, Cli, DecodeArgs};
use crate::input::Input;
use crate::timestamp::time_str;
use crate::wav::{SampleFormat, WavWriter};
use vorbis::utils::errors::{DecodeError, VorbisError};

fn create_path_with_extension(base_path: &Path, expected_ext: &str) -> PathBuf {
    if let Some(existing_ext) = base_path.extension() {
        if existing_ext == expected_ext {
            base_path.to_path_buf()
        } else {
            let mut path = base_path.to_path_buf();
            path.set_extension(expected_ext);
            path
        }
    } else {
        let mut path = base_path.to_path_buf();
        path.set_extension(expected_ext);
        path
    }
}

pub fn cmd_decode(args: &DecodeArgs, cli: &Cli, multi: Option<&MultiProgress>) -> Result<()> {
    macro_rules! pb_update {
        ($pb:expr, $method:ident($($args:expr),*)) => {
            if let Some(ref pb) = $pb {
                pb.$method($($args),*);
            }
        };
    }

    let input = Input::new(&args.input);
    if input.is_pipe() && args.output_path.is_none() {
        return Err(anyhow::anyhow!(
            "An output path is required when reading from stdin"
        ));
    }

    log::info!(
        "Decoding Ogg Vorbis stream: {} (strict mode: {}, stream: {})",
        args.input.display(),
        cli.strict,
        args.stream
    );

    let mut reader = input.open()?;

    let fail_level = if cli.strict { Level::Warn } else { Level::Error };
    reader.set_fail_level(fail_level);
    reader.set_clip_samples(!args.no_clip);

    if args.stream > 0 {
        let format_changed = reader.switch_streams(args.stream)?;
        log::debug!(
            "Switched to stream {} (format change: {format_changed})",
            args.stream
        );
    }

    if let Some(sample) = args.seek {
        reader.seek(sample)?;
        log::info!("Starting at sample {sample}");
    }

    let channels = reader.channels();
    let sample_rate = reader.sample_rate();
    log::info!(
        "{channels} channel(s) at {sample_rate} Hz, vendor: {}",
        reader.vendor()
    );

    let total_samples = if input.is_pipe() {
        None
    } else {
        reader.total_samples().ok()
    };

    let pb = if let Some(multi) = multi {
        let pb = if let Some(total) = total_samples {
            let pb = multi.add(ProgressBar::new(total.max(0) as u64));
            pb.set_style(ProgressStyle::with_template(
                "{bar:40.cyan/blue} {pos}/{len} samples ({percent}%)\n{msg} | elapsed: {elapsed_precise} | ETA: {eta_precise}",
            )?);
            pb.enable_steady_tick(std::time::Duration::from_millis(100));
            pb
        } else {
            let pb = multi.add(ProgressBar::new_spinner());
            pb.set_style(ProgressStyle::with_template(
                "{spinner:.green} {pos} samples\n{msg} | elapsed: {elapsed_precise}",
            )?);
            pb
        };
        pb.set_message("decoding");
        Some(pb)
    } else {
        None
    };

    let base_path = args
        .output_path
        .clone()
        .unwrap_or_else(|| args.input.clone());
    let audio_path = create_path_with_extension(&base_path, "wav");
    log::info!("Creating audio file: {}", audio_path.display());

    let sample_format = match args.format {
        AudioFormat::Float => SampleFormat::Float32,
        AudioFormat::Pcm => SampleFormat::Pcm16,
    };

    let mut writer = WavWriter::new(File::create(&audio_path)?);
    writer.configure_audio_format(sample_rate, channels as u32, sample_format)?;
    writer.write_header()?;

    let mut buffer = vec![0f32; 65536];
    let mut decoded_samples = 0u64;
    let mut chunks = 0u64;
    let start_time = std::time::Instant::now();

    loop {
        match reader.read_samples(&mut buffer) {
            Ok(0) => break,
            Ok(count) => {
                writer.write_samples(&buffer[..count])?;
                decoded_samples += (count / channels) as u64;
                chunks += 1;

                pb_update!(pb, set_position(decoded_samples));
                if chunks.is_multiple_of(16) {
                    let elapsed = start_time.elapsed();
                    let audio_duration_secs = decoded_samples as f64 / sample_rate as f64;
                    let realtime_multiplier = audio_duration_secs / elapsed.as_secs_f64();
                    let time_str = time_str(audio_duration_secs);
                    pb_update!(
                        pb,
                        set_message(format!(
                            "speed: {realtime_multiplier:.1}x | timestamp: {time_str}"
                        ))
                    );
                }
            }
            Err(VorbisError::Decode(DecodeError::ParameterChangePending)) => {
                if reader.channels() != channels || reader.sample_rate() != sample_rate {
                    pb_update!(pb, finish_with_message("decode failed"));
                    return Err(anyhow::anyhow!(
                        "Stream changed format mid-file ({} ch at {} Hz); cannot continue into one output file",
                        reader.channels(),
                        reader.sample_rate()
                    ));
                }
                log::warn!("Stream parameters refreshed mid-file; continuing");
                reader.clear_parameter_change();
            }
            Err(e) => {
                pb_update!(pb, finish_with_message("decode failed"));
                return Err(e.into());
            }
        }
    }

    writer.finish()?;

    let elapsed = start_time.elapsed();
    let audio_duration_secs = decoded_samples as f64 / sample_rate as f64;
    let realtime_multiplier = audio_duration_secs / elapsed.as_secs_f64().max(f64::MIN_POSITIVE);
    let final_time_str = time_str(audio_duration_secs);

    pb_update!(
        pb,
        finish_with_message(format!(
            "speed: {realtime_multiplier:.1}x | timestamp: {final_time_str}"
        ))
    );

    if reader.stats().clipped {
        log::warn!("Some samples exceeded full scale and were clipped");
    }
    log::info!(
        "Decoding completed: {decoded_samples} samples ({final_time_str}), {} kbps effective",
        reader.effective_bit_rate() / 1000
    );

    Ok(())
}
