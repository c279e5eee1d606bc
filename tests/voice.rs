//! Voice pipeline integration tests
//!
//! Tests wake matching and audio helpers without requiring audio hardware

use std::io::Cursor;

use venue_voice::config::{WakeConfig, WakePhraseFileEntry};
use venue_voice::voice::{CAPTURE_SAMPLE_RATE, calculate_energy, samples_to_wav};
use venue_voice::wake::{TerminationPhrases, WakeWordTable, normalize};

mod common;

/// Generate sine wave audio samples
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (CAPTURE_SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / CAPTURE_SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

#[test]
fn test_builtin_wake_phrases() {
    let table = WakeWordTable::builtin();

    let wake = table.find_match("Hey Bartender, can I get a menu?").unwrap();
    assert_eq!(wake.canonical, "hey bartender");
    assert_eq!(wake.variant, "hey bartender");

    // Misheard alias maps to its canonical phrase
    let wake = table.find_match("hey bar keep").unwrap();
    assert_eq!(wake.canonical, "hey barkeep");

    assert!(table.find_match("two beers please").is_none());
    assert!(table.find_match("   ").is_none());
}

#[test]
fn test_truncated_transcript_matches() {
    let table = WakeWordTable::builtin();

    // Recognizer cut the phrase short
    let wake = table.find_match("hey barten").unwrap();
    assert_eq!(wake.canonical, "hey bartender");
}

#[test]
fn test_configured_phrases_extend_table() {
    let config = WakeConfig {
        phrases: vec![WakePhraseFileEntry {
            phrase: "hello host".to_string(),
            aliases: vec!["hello ghost".to_string()],
        }],
        ..WakeConfig::default()
    };

    let table = WakeWordTable::from_config(&config);
    assert_eq!(table.find_match("Hello ghost!").unwrap().canonical, "hello host");
    assert!(table.find_match("hey bartender").is_some());

    let replaced = WakeWordTable::from_config(&WakeConfig {
        replace_defaults: true,
        ..config
    });
    assert!(replaced.find_match("hey bartender").is_none());
    assert_eq!(replaced.len(), 1);
}

#[test]
fn test_termination_phrases() {
    let config = WakeConfig {
        termination_phrases: vec!["cheers mate".to_string()],
        ..WakeConfig::default()
    };
    let phrases = TerminationPhrases::from_config(&config);

    assert_eq!(phrases.find("OK, that's all!"), Some("thats all"));
    assert_eq!(phrases.find("Cheers, mate."), Some("cheers mate"));
    assert!(phrases.find("add another one").is_none());
}

#[test]
fn test_normalize() {
    assert_eq!(normalize("  Hey,   BARTENDER!! "), "hey bartender");
    assert_eq!(normalize("?!"), "");
}

#[test]
fn test_energy() {
    assert!(calculate_energy(&[]).abs() < f32::EPSILON);
    assert!(calculate_energy(&vec![0.0; 480]).abs() < f32::EPSILON);

    let tone = generate_sine_samples(440.0, 0.1, 0.5);
    let energy = calculate_energy(&tone);
    // RMS of a sine is amplitude / sqrt(2)
    assert!((energy - 0.5 / std::f32::consts::SQRT_2).abs() < 0.01);
}

#[test]
fn test_samples_to_wav() {
    let samples = generate_sine_samples(440.0, 0.1, 0.5);
    let wav_data = samples_to_wav(&samples, CAPTURE_SAMPLE_RATE).unwrap();

    // Check WAV header magic
    assert_eq!(&wav_data[0..4], b"RIFF");
    assert_eq!(&wav_data[8..12], b"WAVE");
    assert!(wav_data.len() > 44);
}

#[test]
fn test_wav_roundtrip() {
    let original_samples: Vec<f32> = vec![0.0, 0.5, -0.5, 1.0, -1.0, 0.25];
    let wav_data = samples_to_wav(&original_samples, CAPTURE_SAMPLE_RATE).unwrap();

    let cursor = Cursor::new(wav_data);
    let mut reader = hound::WavReader::new(cursor).unwrap();

    let spec = reader.spec();
    assert_eq!(spec.sample_rate, CAPTURE_SAMPLE_RATE);
    assert_eq!(spec.channels, 1);

    let read_samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(read_samples.len(), original_samples.len());
}
