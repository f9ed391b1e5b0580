//! Pure framing and conversion functions.
//!
//! Everything in here is side-effect free: byte-level request building,
//! bridge response classification, the address-byte bijection and the
//! brightness/arc-power and fade encodings. No function performs I/O.

use crate::defs::bridge;
use crate::error::{Error, Result};
use crate::sansio::types::QueryOutcome;
use crate::DaliAddress;

/// Build a 3-byte bridge request: bridge command plus the two DALI
/// forward-frame bytes.
pub fn bridge_request(cmd: u8, dali1: u8, dali2: u8) -> Vec<u8> {
    vec![cmd, dali1, dali2]
}

/// Classify a 2-byte bridge response to an acknowledged send.
pub fn classify_status(resp1: u8, resp2: u8) -> Result<()> {
    match resp1 {
        bridge::RESP_ACK => match resp2 {
            bridge::ACK_OK | bridge::ACK_TIMEOUT => Ok(()),
            bridge::ACK_FRAME_ERROR => Err(Error::BusFrame),
            bridge::ACK_OVERLOAD => Err(Error::BusOverload),
            bridge::ACK_INVALID_COMMAND => Err(Error::BridgeCommand),
            other => Err(Error::InvalidAnswer(other)),
        },
        // data on a plain send is unexpected but harmless
        bridge::RESP_DATA => Ok(()),
        other => Err(Error::InvalidAnswer(other)),
    }
}

/// Classify a 2-byte bridge response to a query into the three-valued
/// [`QueryOutcome`]. A frame error is a collision, not a failure.
pub fn classify_query(resp1: u8, resp2: u8) -> Result<QueryOutcome> {
    match resp1 {
        bridge::RESP_DATA => Ok(QueryOutcome::Answer(resp2)),
        bridge::RESP_ACK => match resp2 {
            bridge::ACK_TIMEOUT | bridge::ACK_OK => Ok(QueryOutcome::NoAnswer),
            bridge::ACK_FRAME_ERROR => Ok(QueryOutcome::Collision),
            bridge::ACK_OVERLOAD => Err(Error::BusOverload),
            bridge::ACK_INVALID_COMMAND => Err(Error::BridgeCommand),
            other => Err(Error::InvalidAnswer(other)),
        },
        other => Err(Error::InvalidAnswer(other)),
    }
}

/// First forward-frame byte for a direct-arc-power command (bit 0 clear).
pub fn arc_power_byte(address: DaliAddress) -> u8 {
    match address {
        DaliAddress::Short(a) => (a & 0x3F) << 1,
        DaliAddress::Group(g) => 0x80 | ((g & 0x0F) << 1),
        DaliAddress::Broadcast => 0xFE,
    }
}

/// First forward-frame byte for an addressed command (bit 0 set).
pub fn command_byte(address: DaliAddress) -> u8 {
    arc_power_byte(address) | 0x01
}

/// Decode an address byte as carried in backward frames (`0AAAAAAx` for
/// short addresses, `100AAAAx` for groups, `1111111x` for broadcast). The
/// selector bit is ignored. Any other pattern is invalid input to the
/// protocol layer.
pub fn decode_address(byte: u8) -> Result<DaliAddress> {
    if byte >= 0xFE {
        return Ok(DaliAddress::Broadcast);
    }
    match byte & 0x80 {
        0x00 => Ok(DaliAddress::Short((byte >> 1) & 0x3F)),
        _ => {
            if byte & 0x60 != 0 {
                return Err(Error::InvalidAddress(byte));
            }
            Ok(DaliAddress::Group((byte >> 1) & 0x0F))
        }
    }
}

/// Convert logical brightness (0..=100) to the 8-bit logarithmic arc power
/// scale: `arc = round(log10(i*9 + 1) * 254)` with `i = brightness/100`.
///
/// DALI arc power is already roughly logarithmic; squaring the logarithm
/// like this approximates a perceptually linear dimming curve across the
/// visible range. 255 is MASK and never produced.
pub fn brightness_to_arc_power(brightness: f64) -> u8 {
    let intensity = (brightness / 100.0).clamp(0.0, 1.0);
    ((intensity * 9.0 + 1.0).log10() * 254.0).round() as u8
}

/// Inverse of [`brightness_to_arc_power`].
pub fn arc_power_to_brightness(arc_power: u8) -> f64 {
    ((10f64.powf(f64::from(arc_power) / 254.0) - 1.0) / 9.0) * 100.0
}

/// Encode a fade time for STORE_DTR_AS_FADE_TIME.
///
/// The bus encodes fade time as `T = 0.5 * sqrt(2^X)` seconds, so
/// `x = log2((T/0.5)^2)`; the result is clamped into the valid 1..=15 code
/// range, with zero meaning "no fade".
pub fn fade_time_code(transition: std::time::Duration) -> u8 {
    if transition.is_zero() {
        return 0;
    }
    let h = transition.as_secs_f64() / 0.5;
    let x = (h * h).log2();
    if x > 1.0 {
        (x as u8).min(15)
    } else {
        1
    }
}

/// Encode a dimming rate (brightness units per millisecond) for
/// STORE_DTR_AS_FADE_RATE.
///
/// The bus encodes fade rate as `R = 506 / sqrt(2^X)` steps per second, so
/// `x = log2((506/R)^2)`.
pub fn fade_rate_code(dim_per_ms: f64) -> u8 {
    let steps_per_second = dim_per_ms * 1000.0;
    if steps_per_second <= 0.0 {
        return 0;
    }
    let h = 506.0 / steps_per_second;
    let x = (h * h).log2();
    if x > 0.0 {
        (x as u8).min(15)
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_byte_forms() {
        assert_eq!(arc_power_byte(DaliAddress::Short(0)), 0x00);
        assert_eq!(arc_power_byte(DaliAddress::Short(63)), 0x7E);
        assert_eq!(command_byte(DaliAddress::Short(5)), 0x0B);
        assert_eq!(arc_power_byte(DaliAddress::Group(0)), 0x80);
        assert_eq!(command_byte(DaliAddress::Group(15)), 0x9F);
        assert_eq!(arc_power_byte(DaliAddress::Broadcast), 0xFE);
        assert_eq!(command_byte(DaliAddress::Broadcast), 0xFF);
    }

    #[test]
    fn address_roundtrip_is_bijective() {
        for a in 0..64u8 {
            let encoded = command_byte(DaliAddress::Short(a));
            assert_eq!(decode_address(encoded).unwrap(), DaliAddress::Short(a));
        }
        for g in 0..16u8 {
            let encoded = command_byte(DaliAddress::Group(g));
            assert_eq!(decode_address(encoded).unwrap(), DaliAddress::Group(g));
        }
        assert_eq!(decode_address(0xFF).unwrap(), DaliAddress::Broadcast);
        assert_eq!(decode_address(0xFE).unwrap(), DaliAddress::Broadcast);
        // a set bit in the reserved region is not a valid address
        assert!(decode_address(0xC1).is_err());
    }

    #[test]
    fn brightness_roundtrip_within_one_unit() {
        for b in [0.0, 1.0, 25.0, 50.0, 99.0, 100.0] {
            let back = arc_power_to_brightness(brightness_to_arc_power(b));
            assert!(
                (back - b).abs() <= 1.0,
                "brightness {} came back as {}",
                b,
                back
            );
        }
    }

    #[test]
    fn arc_power_extremes() {
        assert_eq!(brightness_to_arc_power(0.0), 0);
        assert_eq!(brightness_to_arc_power(100.0), 254);
        // out-of-range input clamps instead of wrapping into MASK
        assert_eq!(brightness_to_arc_power(250.0), 254);
        assert_eq!(brightness_to_arc_power(-3.0), 0);
    }

    #[test]
    fn fade_time_codes() {
        use std::time::Duration;
        assert_eq!(fade_time_code(Duration::ZERO), 0);
        // very short transitions clamp to the shortest real fade
        assert_eq!(fade_time_code(Duration::from_millis(250)), 1);
        // T=10s -> x = log2((10/0.5)^2) = 8.64 -> 8
        assert_eq!(fade_time_code(Duration::from_secs(10)), 8);
    }

    #[test]
    fn fade_rate_codes() {
        // R=44 steps/sec -> x = log2((506/44)^2) = 7.04 -> 7
        assert_eq!(fade_rate_code(0.044), 7);
        assert_eq!(fade_rate_code(0.0), 0);
        // faster than the bus can go clamps to 0
        assert_eq!(fade_rate_code(1.0), 0);
    }

    #[test]
    fn query_classification_is_three_valued() {
        use crate::defs::bridge::*;
        assert_eq!(
            classify_query(RESP_DATA, 0xFF),
            Ok(QueryOutcome::Answer(0xFF))
        );
        assert_eq!(
            classify_query(RESP_ACK, ACK_TIMEOUT),
            Ok(QueryOutcome::NoAnswer)
        );
        assert_eq!(
            classify_query(RESP_ACK, ACK_FRAME_ERROR),
            Ok(QueryOutcome::Collision)
        );
        assert_eq!(
            classify_query(RESP_ACK, ACK_OVERLOAD),
            Err(Error::BusOverload)
        );
        assert_eq!(classify_query(0x77, 0), Err(Error::InvalidAnswer(0x77)));
    }

    #[test]
    fn yes_no_interpretation() {
        assert!(QueryOutcome::Answer(0xFF).is_yes(false));
        assert!(!QueryOutcome::NoAnswer.is_yes(true));
        assert!(QueryOutcome::Collision.is_yes(true));
        assert!(!QueryOutcome::Collision.is_yes(false));
    }
}
