//! Test Pattern Sender
//!
//! Emits a VIC-style video stream and a matching audio stream over UDP so the
//! receiver can be exercised without hardware.
//!
//! Usage: `sender [host] [video port] [audio port]`

use anyhow::{Context, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, MissedTickBehavior};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use c64u_stream::{
    constants::*,
    protocol::{AudioPacket, PacketHeader, VideoPacket},
    video::VideoStandard,
};

/// Test tone frequency
const TONE_HZ: f64 = 440.0;

/// Build every packet of one PAL frame: diagonal color bars that scroll
fn frame_packets(frame_number: u16, first_sequence: u16) -> Result<Vec<Bytes>> {
    let lines = usize::from(LINES_PER_PACKET);
    let packet_count = PAL_HEIGHT as usize / lines;
    let mut payload = vec![0u8; VIDEO_PAYLOAD_SIZE];
    let mut packets = Vec::with_capacity(packet_count);

    for index in 0..packet_count {
        let first_line = index * lines;
        for (row, line) in payload.chunks_exact_mut(BYTES_PER_LINE).enumerate() {
            let y = first_line + row;
            for (x, byte) in line.iter_mut().enumerate() {
                let color = ((x / 12 + y / 8 + usize::from(frame_number)) % 16) as u8;
                *byte = color | (color << 4);
            }
        }

        let header = PacketHeader::new(
            first_sequence.wrapping_add(index as u16),
            frame_number,
            first_line as u16,
            index + 1 == packet_count,
        );
        packets.push(VideoPacket::encode(&header, &payload)?);
    }

    Ok(packets)
}

fn tone_packet(sequence: u16, phase: &mut f64) -> AudioPacket {
    let step = TONE_HZ * std::f64::consts::TAU / f64::from(AUDIO_SAMPLE_RATE);
    let mut samples = Vec::with_capacity(AUDIO_FRAMES_PER_PACKET * 2);
    for _ in 0..AUDIO_FRAMES_PER_PACKET {
        let sample = (phase.sin() * f64::from(i16::MAX) * 0.25) as i16;
        samples.push(sample);
        samples.push(sample);
        *phase = (*phase + step) % std::f64::consts::TAU;
    }
    AudioPacket { sequence, samples }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let video_port: u16 = match args.next() {
        Some(port) => port.parse().context("Invalid video port")?,
        None => DEFAULT_VIDEO_PORT,
    };
    let audio_port: u16 = match args.next() {
        Some(port) => port.parse().context("Invalid audio port")?,
        None => DEFAULT_AUDIO_PORT,
    };

    let video_addr: SocketAddr = format!("{}:{}", host, video_port)
        .parse()
        .context("Invalid target address")?;
    let audio_addr = SocketAddr::new(video_addr.ip(), audio_port);

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    tracing::info!("Sending test pattern to video {} / audio {}", video_addr, audio_addr);

    let fps = VideoStandard::Pal.native_fps();
    let mut video_tick = interval(Duration::from_secs_f64(1.0 / fps));
    video_tick.set_missed_tick_behavior(MissedTickBehavior::Burst);
    let audio_period =
        Duration::from_secs_f64(AUDIO_FRAMES_PER_PACKET as f64 / f64::from(AUDIO_SAMPLE_RATE));
    let mut audio_tick = interval(audio_period);
    audio_tick.set_missed_tick_behavior(MissedTickBehavior::Burst);

    let mut frame_number: u16 = 0;
    let mut video_sequence: u16 = 0;
    let mut audio_sequence: u16 = 0;
    let mut phase = 0.0f64;
    let mut frames_sent: u64 = 0;

    tracing::info!("Streaming at {:.3} Hz - press Ctrl+C to stop", fps);

    loop {
        tokio::select! {
            _ = video_tick.tick() => {
                let packets = frame_packets(frame_number, video_sequence)?;
                video_sequence = video_sequence.wrapping_add(packets.len() as u16);
                for packet in &packets {
                    if let Err(e) = socket.send_to(packet, video_addr).await {
                        tracing::warn!("Failed to send video packet: {}", e);
                    }
                }
                frame_number = frame_number.wrapping_add(1);
                frames_sent += 1;
                if frames_sent % 500 == 0 {
                    tracing::info!("Sent {} frames", frames_sent);
                }
            }
            _ = audio_tick.tick() => {
                let packet = tone_packet(audio_sequence, &mut phase).encode()?;
                if let Err(e) = socket.send_to(&packet, audio_addr).await {
                    tracing::warn!("Failed to send audio packet: {}", e);
                }
                audio_sequence = audio_sequence.wrapping_add(1);
            }
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                break;
            }
        }
    }

    tracing::info!("Stopped after {} frames", frames_sent);
    Ok(())
}
