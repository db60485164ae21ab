//! Container sniffing for uploaded audio
//!
//! The format a client declares is advisory; the leading bytes of the
//! payload are what the gateways actually decode. Detection covers the four
//! accepted containers plus ADTS/AAC, which is recognized only so it can be
//! rejected with a hint instead of a generic failure.

use spar_core::{AudioFormat, Result, SparError};

/// Anything shorter than this cannot even hold a container header.
pub const MIN_AUDIO_BYTES: usize = 12;

/// Identify the container from the payload's magic bytes.
pub fn sniff_format(bytes: &[u8]) -> Result<AudioFormat> {
    if bytes.is_empty() {
        return Err(SparError::AudioEmpty);
    }
    if bytes.len() < MIN_AUDIO_BYTES {
        return Err(SparError::UnsupportedAudioFormat("truncated".to_string()));
    }

    if &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        return Ok(AudioFormat::Wav);
    }
    if &bytes[0..4] == b"OggS" {
        return Ok(AudioFormat::Ogg);
    }
    if &bytes[0..4] == b"fLaC" {
        return Ok(AudioFormat::Flac);
    }
    if &bytes[0..3] == b"ID3" {
        return Ok(AudioFormat::Mp3);
    }
    if bytes[0] == 0xFF {
        // ADTS shares the MPEG sync word; its layer bits are zero where
        // MP3 sets them.
        if bytes[1] & 0xF6 == 0xF0 {
            return Err(SparError::UnsupportedAudioFormat("aac".to_string()));
        }
        if bytes[1] & 0xE0 == 0xE0 {
            return Ok(AudioFormat::Mp3);
        }
    }

    Err(SparError::UnsupportedAudioFormat("unknown".to_string()))
}

/// Resolve the format the pipeline will trust. The sniffed container wins
/// over the declaration, which survives only as a log line.
pub fn resolve_format(bytes: &[u8], declared: Option<AudioFormat>) -> Result<AudioFormat> {
    let sniffed = sniff_format(bytes)?;
    if let Some(declared) = declared {
        if declared != sniffed {
            tracing::debug!(
                "client declared {} audio but the payload sniffs as {}",
                declared,
                sniffed
            );
        }
    }
    Ok(sniffed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded(head: &[u8]) -> Vec<u8> {
        let mut bytes = head.to_vec();
        bytes.resize(MIN_AUDIO_BYTES.max(bytes.len()), 0);
        bytes
    }

    #[test]
    fn test_sniffs_the_accepted_containers() {
        let wav = b"RIFF\x24\x08\x00\x00WAVEfmt ";
        assert_eq!(sniff_format(wav).unwrap(), AudioFormat::Wav);

        assert_eq!(
            sniff_format(&padded(b"OggS\x00\x02")).unwrap(),
            AudioFormat::Ogg
        );
        assert_eq!(
            sniff_format(&padded(b"fLaC\x00\x00\x00\x22")).unwrap(),
            AudioFormat::Flac
        );
        assert_eq!(
            sniff_format(&padded(b"ID3\x04\x00\x00")).unwrap(),
            AudioFormat::Mp3
        );
        assert_eq!(
            sniff_format(&padded(&[0xFF, 0xFB, 0x90, 0x64])).unwrap(),
            AudioFormat::Mp3
        );
    }

    #[test]
    fn test_adts_is_rejected_with_a_name() {
        let err = sniff_format(&padded(&[0xFF, 0xF1, 0x50, 0x80])).unwrap_err();
        match err {
            SparError::UnsupportedAudioFormat(hint) => assert_eq!(hint, "aac"),
            other => panic!("expected unsupported format, got {other}"),
        }
    }

    #[test]
    fn test_empty_and_truncated_payloads() {
        assert!(matches!(sniff_format(&[]), Err(SparError::AudioEmpty)));
        assert!(matches!(
            sniff_format(b"RIFF"),
            Err(SparError::UnsupportedAudioFormat(_))
        ));
    }

    #[test]
    fn test_garbage_is_unsupported() {
        let err = sniff_format(&padded(b"not audio at all")).unwrap_err();
        assert_eq!(err.code(), "unsupported_audio_format");
    }

    #[test]
    fn test_bytes_win_over_the_declaration() {
        let wav = b"RIFF\x24\x08\x00\x00WAVEfmt ";
        let resolved = resolve_format(wav, Some(AudioFormat::Mp3)).unwrap();
        assert_eq!(resolved, AudioFormat::Wav);
    }
}
