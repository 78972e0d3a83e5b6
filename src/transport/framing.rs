//! Ledger HID framing: APDUs are split over 64-byte reports, each carrying a
//! channel id, a command tag and a big-endian sequence number. The first
//! report of a message also carries the total message length.

use super::TransportError;

pub const HID_PACKET_SIZE: usize = 64;
pub const CHANNEL: u16 = 0x0101;
pub const TAG_APDU: u8 = 0x05;

const HEADER_LEN: usize = 5;
const LENGTH_LEN: usize = 2;

/// Split an encoded APDU into zero-padded HID reports.
pub fn wrap_command(apdu: &[u8]) -> Vec<[u8; HID_PACKET_SIZE]> {
    let mut packets = Vec::new();
    let mut offset = 0;
    let mut sequence: u16 = 0;

    loop {
        let mut packet = [0u8; HID_PACKET_SIZE];
        packet[..2].copy_from_slice(&CHANNEL.to_be_bytes());
        packet[2] = TAG_APDU;
        packet[3..HEADER_LEN].copy_from_slice(&sequence.to_be_bytes());

        let mut start = HEADER_LEN;
        if sequence == 0 {
            packet[start..start + LENGTH_LEN].copy_from_slice(&(apdu.len() as u16).to_be_bytes());
            start += LENGTH_LEN;
        }

        let take = (HID_PACKET_SIZE - start).min(apdu.len() - offset);
        packet[start..start + take].copy_from_slice(&apdu[offset..offset + take]);
        offset += take;
        packets.push(packet);

        if offset >= apdu.len() {
            return packets;
        }
        sequence = sequence.wrapping_add(1);
    }
}

/// Reassembles one response from incoming HID reports.
#[derive(Debug, Default)]
pub struct ResponseReader {
    expected_len: Option<usize>,
    sequence: u16,
    data: Vec<u8>,
}

impl ResponseReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one report. Returns the full response once every byte arrived.
    pub fn push(&mut self, packet: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        if packet.len() < HEADER_LEN {
            return Err(TransportError::Io(format!("short HID report ({} bytes)", packet.len())));
        }

        let channel = u16::from_be_bytes([packet[0], packet[1]]);
        if channel != CHANNEL || packet[2] != TAG_APDU {
            return Err(TransportError::Io(format!(
                "unexpected HID report header {:02x?}",
                &packet[..3]
            )));
        }

        let sequence = u16::from_be_bytes([packet[3], packet[4]]);
        if sequence != self.sequence {
            return Err(TransportError::Io(format!(
                "HID report out of sequence: expected {}, got {}",
                self.sequence, sequence
            )));
        }

        let mut body = &packet[HEADER_LEN..];
        let expected = match self.expected_len {
            Some(len) => len,
            None => {
                if body.len() < LENGTH_LEN {
                    return Err(TransportError::Io("missing response length".to_string()));
                }
                let len = u16::from_be_bytes([body[0], body[1]]) as usize;
                body = &body[LENGTH_LEN..];
                self.expected_len = Some(len);
                len
            }
        };

        let take = (expected - self.data.len()).min(body.len());
        self.data.extend_from_slice(&body[..take]);
        self.sequence = self.sequence.wrapping_add(1);

        if self.data.len() == expected {
            Ok(Some(std::mem::take(&mut self.data)))
        } else {
            Ok(None)
        }
    }
}

/// Split off the status word: success keeps the whole response (status
/// included), anything else becomes [`TransportError::Status`].
pub fn check_status(response: Vec<u8>) -> Result<Vec<u8>, TransportError> {
    if response.len() < 2 {
        return Err(TransportError::Io(format!(
            "response too short for a status word ({} bytes)",
            response.len()
        )));
    }
    let status = u16::from_be_bytes([response[response.len() - 2], response[response.len() - 1]]);
    if status == 0x9000 {
        Ok(response)
    } else {
        Err(TransportError::Status(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_packets(response: &[u8]) -> Vec<[u8; HID_PACKET_SIZE]> {
        // device replies use the same framing as host commands
        wrap_command(response)
    }

    #[test]
    fn test_short_command_fits_one_report() {
        let packets = wrap_command(&[0xe0, 0x03, 0x00, 0x00, 0x00]);
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0][..12], &[0x01, 0x01, 0x05, 0, 0, 0, 5, 0xe0, 0x03, 0, 0, 0]);
        assert!(packets[0][12..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_long_command_spans_reports() {
        let apdu: Vec<u8> = (0..260u16).map(|i| i as u8).collect();
        let packets = wrap_command(&apdu);
        // 57 bytes in the first report, 59 in each following one
        assert_eq!(packets.len(), 5);
        assert_eq!(&packets[1][..5], &[0x01, 0x01, 0x05, 0, 1]);
        assert_eq!(packets[1][5], 57);
        assert_eq!(&packets[4][3..5], &[0, 4]);
    }

    #[test]
    fn test_reader_reassembles_multi_report_response() {
        let response: Vec<u8> = (0..150u8).chain([0x90, 0x00]).collect();
        let mut reader = ResponseReader::new();
        let packets = response_packets(&response);

        let mut out = None;
        for (i, packet) in packets.iter().enumerate() {
            out = reader.push(packet).unwrap();
            assert_eq!(out.is_some(), i == packets.len() - 1);
        }
        assert_eq!(out.unwrap(), response);
    }

    #[test]
    fn test_reader_rejects_bad_sequence_and_channel() {
        let packets = response_packets(&[0u8; 100]);
        let mut reader = ResponseReader::new();
        assert!(reader.push(&packets[1]).is_err());

        let mut foreign = packets[0];
        foreign[0] = 0x02;
        assert!(ResponseReader::new().push(&foreign).is_err());
    }

    #[test]
    fn test_check_status() {
        assert_eq!(check_status(vec![1, 0x90, 0x00]), Ok(vec![1, 0x90, 0x00]));
        assert_eq!(check_status(vec![0x69, 0x85]), Err(TransportError::Status(0x6985)));
        assert!(matches!(check_status(vec![0x90]), Err(TransportError::Io(_))));
    }
}
