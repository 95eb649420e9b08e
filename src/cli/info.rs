use anyhow::Result;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::Level;
use serde::Serialize;

use super::command::{Cli, InfoArgs};
use crate::input::Input;
use crate::timestamp::time_str;
use vorbis::process::reader::OggVorbisReader;
use vorbis::utils::errors::{DecodeError, VorbisError};

pub fn cmd_info(args: &InfoArgs, cli: &Cli, multi: Option<&MultiProgress>) -> Result<()> {
    log::info!("Analyzing Ogg Vorbis stream: {}", args.input.display());

    let input = Input::new(&args.input);
    let mut reader = match input.open() {
        Ok(reader) => reader,
        Err(e) if e.downcast_ref::<VorbisError>().is_some() => {
            println!("No Vorbis audio found in the file.");
            println!("This doesn't appear to be a valid Ogg Vorbis stream.");
            log::debug!("Open failed: {e}");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let fail_level = if cli.strict { Level::Warn } else { Level::Error };
    reader.set_fail_level(fail_level);

    let mut report = Report {
        streams: collect_streams(&mut reader)?,
        analysis: None,
    };

    if args.scan {
        report.analysis = Some(scan_stream(&mut reader, multi)?);
    }

    if args.yaml {
        print!("{}", serde_yaml_ng::to_string(&report)?);
    } else {
        display_report(&report);
    }

    Ok(())
}

#[derive(Serialize)]
struct Report {
    streams: Vec<StreamReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    analysis: Option<AnalysisReport>,
}

#[derive(Serialize)]
struct StreamReport {
    index: usize,
    channels: usize,
    sample_rate: u32,
    upper_bitrate: i32,
    nominal_bitrate: i32,
    lower_bitrate: i32,
    vendor: String,
    comments: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_samples: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<String>,
}

#[derive(Serialize)]
struct AnalysisReport {
    packets: u64,
    pages_read: usize,
    total_pages: Option<u64>,
    audio_bits: u64,
    overhead_bits: u64,
    effective_bit_rate: u64,
    clipped: bool,
}

fn collect_streams(reader: &mut OggVorbisReader) -> Result<Vec<StreamReport>> {
    let mut streams = Vec::new();

    for index in 0..reader.stream_count() {
        reader.switch_streams(index)?;

        let total_samples = reader.total_samples().ok();
        let duration = total_samples
            .map(|samples| time_str(samples as f64 / reader.sample_rate() as f64));

        streams.push(StreamReport {
            index,
            channels: reader.channels(),
            sample_rate: reader.sample_rate(),
            upper_bitrate: reader.upper_bitrate(),
            nominal_bitrate: reader.nominal_bitrate(),
            lower_bitrate: reader.lower_bitrate(),
            vendor: reader.vendor().to_string(),
            comments: reader.comments().to_vec(),
            total_samples,
            duration,
        });
    }

    reader.switch_streams(0)?;
    Ok(streams)
}

/// Decodes the active stream to the end so payload and overhead
/// accounting covers the whole file.
fn scan_stream(
    reader: &mut OggVorbisReader,
    multi: Option<&MultiProgress>,
) -> Result<AnalysisReport> {
    let pb = if let Some(multi) = multi {
        let pb = multi.add(ProgressBar::new_spinner());
        pb.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        pb.set_message("Scanning packets...");
        Some(pb)
    } else {
        None
    };

    let channels = reader.channels();
    let mut buffer = vec![0f32; 65536];
    let mut samples = 0u64;

    loop {
        match reader.read_samples(&mut buffer) {
            Ok(0) => break,
            Ok(count) => {
                samples += (count / channels) as u64;
                if let Some(ref pb) = pb {
                    pb.set_message(format!("Scanning packets...       {samples} samples"));
                }
            }
            Err(VorbisError::Decode(DecodeError::ParameterChangePending)) => {
                reader.clear_parameter_change();
            }
            Err(e) => {
                if let Some(ref pb) = pb {
                    pb.finish_and_clear();
                }
                return Err(e.into());
            }
        }
    }

    if let Some(ref pb) = pb {
        pb.finish_and_clear();
    }

    let stats = reader.stats();
    let overhead = stats.overhead_bits(reader.container_overhead_bits());
    Ok(AnalysisReport {
        packets: stats.packet_count,
        pages_read: reader.pages_read(),
        total_pages: reader.total_pages().ok(),
        audio_bits: reader.stats().audio_bits(),
        overhead_bits: overhead,
        effective_bit_rate: reader.effective_bit_rate(),
        clipped: reader.stats().clipped,
    })
}

fn display_report(report: &Report) {
    println!();
    println!("Ogg Vorbis Stream Information");
    println!("=============================");
    println!();

    for stream in &report.streams {
        display_stream_report(stream);
    }

    if let Some(analysis) = &report.analysis {
        display_analysis(analysis);
    }
}

fn display_stream_report(stream: &StreamReport) {
    println!("Stream {}", stream.index);
    println!("  Channels                  {}", stream.channels);
    println!("  Sample rate               {} Hz", stream.sample_rate);

    if stream.nominal_bitrate > 0 {
        println!("  Nominal bitrate           {} bps", stream.nominal_bitrate);
    }
    if stream.upper_bitrate > 0 {
        println!("  Upper bitrate             {} bps", stream.upper_bitrate);
    }
    if stream.lower_bitrate > 0 {
        println!("  Lower bitrate             {} bps", stream.lower_bitrate);
    }

    if let (Some(samples), Some(duration)) = (&stream.total_samples, &stream.duration) {
        println!("  Length                    {samples} samples");
        println!("  Duration                  {duration}");
    }

    println!("  Vendor                    {}", stream.vendor);

    if !stream.comments.is_empty() {
        println!("  Comments");
        for comment in &stream.comments {
            println!("    {comment}");
        }
    }
    println!();
}

fn display_analysis(analysis: &AnalysisReport) {
    println!("Analysis Summary");
    println!("  Packets processed         {}", analysis.packets);
    match analysis.total_pages {
        Some(total) => println!(
            "  Pages                     {} of {total}",
            analysis.pages_read
        ),
        None => println!("  Pages                     {}", analysis.pages_read),
    }
    println!("  Audio payload             {} bits", analysis.audio_bits);
    println!("  Container overhead        {} bits", analysis.overhead_bits);

    let kbps = analysis.effective_bit_rate as f64 / 1000.0;
    println!("  Effective bitrate         {kbps:.1} kbps");

    if analysis.clipped {
        println!("  Clipping                  detected");
    }
    println!();
}
