//! The IEEE 1284.4 ("D4") framing engine: packet encode/decode, channel
//! multiplexing, credit accounting, and the channel-0 command dispatch
//! table.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::error::{D4ErrorCode, Error, ProtocolError, TransportError};
use crate::transport::Transport;

const HEADER_LEN: usize = 6;
const MODE_ESCAPE: &[u8] = b"\x00\x00\x00\x1b\x01@EJL 1284.4\n@EJL\n@EJL\n";
const CREDIT_WAIT: Duration = Duration::from_millis(100);

/// One D4 frame: a 6-byte header plus a payload.
///
/// `control` bit 1 (`0x02`) is the end-of-data flag; this protocol profile
/// always sets it on outbound channel-data fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct D4Packet {
    pub psid: u8,
    pub ssid: u8,
    pub credit: u8,
    pub control: u8,
    pub payload: Vec<u8>,
}

impl D4Packet {
    pub fn new(psid: u8, ssid: u8, credit: u8, control: u8, payload: Vec<u8>) -> Self {
        D4Packet { psid, ssid, credit, control, payload }
    }

    /// Encode to the big-endian wire frame: `psid ssid length:u16 credit control payload`.
    pub fn encode(&self) -> Vec<u8> {
        let length = (HEADER_LEN + self.payload.len()) as u16;
        let mut out = Vec::with_capacity(length as usize);
        out.push(self.psid);
        out.push(self.ssid);
        out.extend_from_slice(&length.to_be_bytes());
        out.push(self.credit);
        out.push(self.control);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode a header (6 bytes) plus its matching payload slice.
    pub fn decode(header: &[u8; HEADER_LEN], payload: Vec<u8>) -> Self {
        D4Packet {
            psid: header[0],
            ssid: header[1],
            credit: header[4],
            control: header[5],
            payload,
        }
    }

    fn length(&self) -> u16 {
        (HEADER_LEN + self.payload.len()) as u16
    }
}

/// Channel-0 command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum D4Command {
    Init = 0,
    OpenChannel = 1,
    CloseChannel = 2,
    Credit = 3,
    CreditRequest = 4,
    Exit = 8,
    GetSocketId = 9,
}

impl D4Command {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Commands that may be sent before the engine holds any credit on
    /// channel 0.
    fn requires_credit(self) -> bool {
        !matches!(self, D4Command::Init | D4Command::Exit)
    }

    /// Every command's reply is read and validated on channel 0 except
    /// `Exit`, which is best-effort on a possibly-broken link.
    fn expects_reply(self) -> bool {
        !matches!(self, D4Command::Exit)
    }
}

/// A single multiplexed D4 conversation.
pub struct D4Channel {
    pub ssid: u8,
    pub psid: Option<u8>,
    pub mtu: Option<u16>,
    pub tx_credits: i64,
    pub rx_credits: u32,
    pub rx_credits_max: u32,
    pub rx_queue: VecDeque<D4Packet>,
}

impl D4Channel {
    fn new(ssid: u8) -> Self {
        D4Channel {
            ssid,
            psid: None,
            mtu: None,
            tx_credits: 0,
            rx_credits: 0,
            rx_credits_max: 1,
            rx_queue: VecDeque::new(),
        }
    }
}

/// Owns the transport and the `psid → D4Channel` table.
pub struct D4Engine {
    transport: Box<dyn Transport>,
    channels: BTreeMap<u8, D4Channel>,
}

impl D4Engine {
    /// Runs the construction sequence: installs channel 0, drains stray
    /// bytes, performs the mode-escape negotiation, then sends `Init`.
    pub fn connect(mut transport: Box<dyn Transport>) -> Result<Self, Error> {
        let mut channel0 = D4Channel::new(0);
        channel0.psid = Some(0);
        channel0.tx_credits = 1;
        let mut channels = BTreeMap::new();
        channels.insert(0u8, channel0);

        transport.drain()?;
        transport.write(MODE_ESCAPE)?;
        let _discarded = transport.read(8)?;

        let mut engine = D4Engine { transport, channels };
        engine.init()?;
        Ok(engine)
    }

    fn channel0(&mut self) -> &mut D4Channel {
        self.channels.get_mut(&0).expect("channel 0 is always installed")
    }

    /// Encode, transmit, and account for one outbound packet.
    fn write_packet(&mut self, packet: &D4Packet) -> Result<(), Error> {
        tracing::trace!(psid = packet.psid, ssid = packet.ssid, bytes = ?packet.encode(), "> d4 frame");
        self.transport.write(&packet.encode())?;
        if let Some(channel) = self.channels.get_mut(&packet.psid) {
            channel.tx_credits -= 1;
        }
        Ok(())
    }

    /// Read exactly one frame off the transport and demultiplex it into its
    /// channel's `rx_queue`. Packets for an unknown `psid` are logged and
    /// dropped, per the preserved original behavior.
    fn read_next_packet(&mut self) -> Result<(), Error> {
        let mut header = [0u8; HEADER_LEN];
        let raw = self.transport.read(HEADER_LEN)?;
        header.copy_from_slice(&raw[..HEADER_LEN]);
        let length = u16::from_be_bytes([header[2], header[3]]) as usize;
        let payload_len = length.saturating_sub(HEADER_LEN);
        let payload = self.transport.read(payload_len)?;
        let packet = D4Packet::decode(&header, payload);
        tracing::trace!(psid = packet.psid, ssid = packet.ssid, "< d4 frame");

        match self.channels.get_mut(&packet.psid) {
            Some(channel) => {
                channel.tx_credits += packet.credit as i64;
                channel.rx_credits = channel.rx_credits.saturating_sub(1);
                channel.rx_queue.push_back(packet);
            }
            None => {
                tracing::warn!(psid = packet.psid, "dropping packet for unknown socket");
            }
        }
        Ok(())
    }

    /// Drive `read_next_packet` until `psid`'s queue is non-empty, then pop.
    fn read_packet(&mut self, psid: u8) -> Result<D4Packet, Error> {
        loop {
            if !self.channels.contains_key(&psid) {
                return Err(ProtocolError::UnknownSocket(psid).into());
            }
            if let Some(channel) = self.channels.get_mut(&psid) {
                if let Some(packet) = channel.rx_queue.pop_front() {
                    return Ok(packet);
                }
            }
            self.read_next_packet()?;
        }
    }

    /// Send a channel-0 command and, if its table entry carries a reply,
    /// return the response payload with the 2-byte opcode/zero prefix
    /// stripped.
    fn command(&mut self, cmd: D4Command, payload: &[u8]) -> Result<Vec<u8>, Error> {
        if cmd.requires_credit() && self.channel0().tx_credits < 1 {
            return Err(ProtocolError::InsufficientCredit.into());
        }
        let mut body = Vec::with_capacity(1 + payload.len());
        body.push(cmd.as_u8());
        body.extend_from_slice(payload);
        let packet = D4Packet::new(0, 0, 1, 0, body);
        self.write_packet(&packet)?;

        if !cmd.expects_reply() {
            return Ok(Vec::new());
        }
        let reply = self.read_packet(0)?;
        self.validate_reply(cmd, &reply)
    }

    fn validate_reply(&self, cmd: D4Command, reply: &D4Packet) -> Result<Vec<u8>, Error> {
        let p = &reply.payload;
        if p.is_empty() {
            return Err(ProtocolError::ShortResponse { expected_at_least: 2, got: p.len() }.into());
        }
        if p[0] == 0x7F {
            let code = *p.get(3).unwrap_or(&0x85);
            return Err(ProtocolError::DeviceError(D4ErrorCode(code)).into());
        }
        let expected = cmd.as_u8() | 0x80;
        if p[0] != expected {
            return Err(ProtocolError::OpcodeMismatch { expected, got: p[0] }.into());
        }
        if p.len() < 2 {
            return Err(ProtocolError::ShortResponse { expected_at_least: 2, got: p.len() }.into());
        }
        if p[1] != 0 {
            return Err(ProtocolError::MalformedResponsePrefix(p[1]).into());
        }
        Ok(p[2..].to_vec())
    }

    fn init(&mut self) -> Result<(), Error> {
        let reply = self.command(D4Command::Init, &[0x10])?;
        if reply != [0x10] {
            return Err(ProtocolError::ShortResponse { expected_at_least: 1, got: reply.len() }.into());
        }
        Ok(())
    }

    fn get_socket_id(&mut self, name: &str) -> Result<u8, Error> {
        let reply = self.command(D4Command::GetSocketId, name.as_bytes())?;
        reply
            .first()
            .copied()
            .ok_or_else(|| ProtocolError::ShortResponse { expected_at_least: 1, got: 0 }.into())
    }

    fn open_channel_request(&mut self, psid: u8, ssid: u8) -> Result<(u8, u8, u16, u16, u16), Error> {
        let mut payload = Vec::with_capacity(10);
        payload.push(psid);
        payload.push(ssid);
        payload.extend_from_slice(&0xFFFFu16.to_be_bytes());
        payload.extend_from_slice(&0xFFFFu16.to_be_bytes());
        payload.extend_from_slice(&0x0000u16.to_be_bytes());
        payload.extend_from_slice(&0x0000u16.to_be_bytes());
        let reply = self.command(D4Command::OpenChannel, &payload)?;
        if reply.len() < 8 {
            return Err(ProtocolError::ShortResponse { expected_at_least: 8, got: reply.len() }.into());
        }
        let resp_psid = reply[0];
        let resp_ssid = reply[1];
        let mtu = u16::from_be_bytes([reply[2], reply[3]]);
        let max_credit = u16::from_be_bytes([reply[4], reply[5]]);
        let credit = u16::from_be_bytes([reply[6], reply[7]]);
        Ok((resp_psid, resp_ssid, mtu, max_credit, credit))
    }

    fn close_channel_request(&mut self, psid: u8, ssid: u8) -> Result<(), Error> {
        self.command(D4Command::CloseChannel, &[psid, ssid])?;
        Ok(())
    }

    fn credit_request(&mut self, psid: u8, ssid: u8, amount: u16) -> Result<u16, Error> {
        let mut payload = vec![psid, ssid];
        payload.extend_from_slice(&amount.to_be_bytes());
        let reply = self.command(D4Command::CreditRequest, &payload)?;
        if reply.len() < 4 {
            return Err(ProtocolError::ShortResponse { expected_at_least: 4, got: reply.len() }.into());
        }
        Ok(u16::from_be_bytes([reply[2], reply[3]]))
    }

    fn grant_credit(&mut self, psid: u8, ssid: u8, amount: u16) -> Result<(), Error> {
        let mut payload = vec![psid, ssid];
        payload.extend_from_slice(&amount.to_be_bytes());
        self.command(D4Command::Credit, &payload)?;
        Ok(())
    }

    /// Resolve `name` via `GetSocketID`, open a channel for it, and grant
    /// the peer enough credit to reply immediately.
    pub fn open_named_channel(&mut self, name: &str) -> Result<u8, Error> {
        let socket_id = self.get_socket_id(name)?;
        let mut channel = D4Channel::new(socket_id);

        let (psid, ssid, mtu, _max_credit, credit) = self.open_channel_request(socket_id, socket_id)?;
        channel.psid = Some(psid);
        channel.mtu = Some(mtu);
        channel.tx_credits = credit as i64;
        channel.ssid = ssid;
        let rx_credits_max = channel.rx_credits_max;
        self.channels.insert(psid, channel);

        self.grant_credit(psid, ssid, rx_credits_max as u16)?;
        if let Some(channel) = self.channels.get_mut(&psid) {
            channel.rx_credits = rx_credits_max;
        }
        Ok(psid)
    }

    pub fn close_channel(&mut self, psid: u8) -> Result<(), Error> {
        if let Some(channel) = self.channels.get(&psid) {
            let ssid = channel.ssid;
            self.close_channel_request(psid, ssid)?;
        }
        self.channels.remove(&psid);
        Ok(())
    }

    /// Split `payload` into `mtu - 6`-byte fragments and emit each as a
    /// channel-data packet, handling credit piggyback and exhaustion.
    pub fn channel_write(&mut self, psid: u8, payload: &[u8]) -> Result<(), Error> {
        let (ssid, mtu) = {
            let channel = self.channels.get(&psid).ok_or(ProtocolError::UnknownSocket(psid))?;
            (channel.ssid, channel.mtu.unwrap_or(64) as usize)
        };
        let fragment_size = mtu.saturating_sub(HEADER_LEN).max(1);
        let fragments: Vec<&[u8]> = if payload.is_empty() {
            vec![&[][..]]
        } else {
            payload.chunks(fragment_size).collect()
        };

        for fragment in fragments {
            self.ensure_tx_credit(psid)?;
            let credit = {
                let channel = self.channels.get(&psid).ok_or(ProtocolError::UnknownSocket(psid))?;
                (channel.rx_credits_max.saturating_sub(channel.rx_credits)).min(0xFF) as u8
            };
            let packet = D4Packet::new(psid, ssid, credit, 2, fragment.to_vec());
            self.write_packet(&packet)?;
            if let Some(channel) = self.channels.get_mut(&psid) {
                channel.rx_credits += credit as u32;
            }
        }
        Ok(())
    }

    fn ensure_tx_credit(&mut self, psid: u8) -> Result<(), Error> {
        loop {
            let (ssid, has_credit) = {
                let channel = self.channels.get(&psid).ok_or(ProtocolError::UnknownSocket(psid))?;
                (channel.ssid, channel.tx_credits >= 1)
            };
            if has_credit {
                return Ok(());
            }
            let grant = self.credit_request(psid, ssid, 0xFFFF)?;
            if grant > 0 {
                if let Some(channel) = self.channels.get_mut(&psid) {
                    channel.tx_credits += grant as i64;
                }
                return Ok(());
            }
            std::thread::sleep(CREDIT_WAIT);
        }
    }

    /// Return the next queued packet on `psid`, replenishing advertised
    /// credit first if the backlog has grown past `0xFF`.
    pub fn channel_read(&mut self, psid: u8) -> Result<D4Packet, Error> {
        let (ssid, deficit) = {
            let channel = self.channels.get(&psid).ok_or(ProtocolError::UnknownSocket(psid))?;
            (channel.ssid, channel.rx_credits_max.saturating_sub(channel.rx_credits))
        };
        if deficit > 0xFF {
            self.grant_credit(psid, ssid, deficit as u16)?;
            if let Some(channel) = self.channels.get_mut(&psid) {
                channel.rx_credits = channel.rx_credits_max;
            }
        }
        self.read_packet(psid)
    }

    pub fn channel(&self, psid: u8) -> Option<&D4Channel> {
        self.channels.get(&psid)
    }

    pub fn identify(&mut self) -> Result<String, Error> {
        self.transport.identify()
    }

    pub fn has_channel(&self, psid: u8) -> bool {
        self.channels.contains_key(&psid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    fn scripted_transport() -> LoopbackTransport {
        let mut t = LoopbackTransport::new("MFG:EPSON;MDL:XP-900;");
        t.push_reply(&[0u8; 8]); // mode-escape reply
        // Init reply: psid=0 ssid=0 credit=1 control=0 payload=[0x80,0x00,0x10].
        // The credit field replenishes channel 0 so the next command can send.
        t.push_reply(&D4Packet::new(0, 0, 1, 0, vec![0x80, 0x00, 0x10]).encode());
        t
    }

    #[test]
    fn packet_round_trip() {
        let packet = D4Packet::new(7, 3, 1, 2, vec![1, 2, 3, 4, 5]);
        let encoded = packet.encode();
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&encoded[..HEADER_LEN]);
        let decoded = D4Packet::decode(&header, encoded[HEADER_LEN..].to_vec());
        assert_eq!(packet, decoded);
        assert_eq!(packet.length() as usize, encoded.len());
    }

    #[test]
    fn zero_length_payload_round_trips() {
        let packet = D4Packet::new(0, 0, 0, 2, Vec::new());
        let encoded = packet.encode();
        assert_eq!(encoded.len(), HEADER_LEN);
        assert_eq!(u16::from_be_bytes([encoded[2], encoded[3]]), HEADER_LEN as u16);
    }

    #[test]
    fn s1_init_handshake_completes() {
        let t = scripted_transport();
        let engine = D4Engine::connect(Box::new(t)).expect("construction should succeed");
        assert!(engine.has_channel(0));
        assert!(engine.channel(0).unwrap().tx_credits >= 0);
    }

    #[test]
    fn s2_open_and_close_named_channel() {
        let mut t = scripted_transport();
        // GetSocketID reply: credit=1 (replenishes channel 0), payload [0x89, 0x00, socket_id]
        t.push_reply(&D4Packet::new(0, 0, 1, 0, vec![0x89, 0x00, 5]).encode());
        // OpenChannel reply: credit=1, payload psid=5 ssid=5 mtu=64 max_credit=1 credit=2
        let mut open_reply = vec![0x81, 0x00, 5, 5];
        open_reply.extend_from_slice(&64u16.to_be_bytes());
        open_reply.extend_from_slice(&1u16.to_be_bytes());
        open_reply.extend_from_slice(&2u16.to_be_bytes());
        t.push_reply(&D4Packet::new(0, 0, 1, 0, open_reply).encode());
        // Credit reply (grant_credit's own ack): credit=1, payload [0x83, 0x00]
        t.push_reply(&D4Packet::new(0, 0, 1, 0, vec![0x83, 0x00]).encode());
        // CloseChannel reply: credit=1, payload [0x82, 0x00]
        t.push_reply(&D4Packet::new(0, 0, 1, 0, vec![0x82, 0x00]).encode());

        let mut engine = D4Engine::connect(Box::new(t)).unwrap();
        let psid = engine.open_named_channel("EPSON-CTRL").unwrap();
        assert_eq!(psid, 5);
        assert!(engine.has_channel(5));

        engine.close_channel(psid).unwrap();
        assert!(!engine.has_channel(5));
    }

    #[test]
    fn s3_credit_exhaustion_blocks_until_granted() {
        let mut t = scripted_transport();
        t.push_reply(&D4Packet::new(0, 0, 1, 0, vec![0x89, 0x00, 5]).encode());
        let mut open_reply = vec![0x81, 0x00, 5, 5];
        open_reply.extend_from_slice(&64u16.to_be_bytes());
        open_reply.extend_from_slice(&1u16.to_be_bytes());
        open_reply.extend_from_slice(&0u16.to_be_bytes()); // zero initial tx_credits
        t.push_reply(&D4Packet::new(0, 0, 1, 0, open_reply).encode());
        // Credit reply (grant_credit's own ack): credit=1, payload [0x83, 0x00]
        t.push_reply(&D4Packet::new(0, 0, 1, 0, vec![0x83, 0x00]).encode());
        // CreditRequest reply: credit=1 (replenishes channel 0), payload grants 3
        t.push_reply(&D4Packet::new(0, 0, 1, 0, vec![0x84, 0x00, 5, 5, 0x00, 0x03]).encode());

        let mut engine = D4Engine::connect(Box::new(t)).unwrap();
        let psid = engine.open_named_channel("EPSON-CTRL").unwrap();
        assert_eq!(engine.channel(psid).unwrap().tx_credits, 0);

        engine.channel_write(psid, b"hi").unwrap();
        assert_eq!(engine.channel(psid).unwrap().tx_credits, 2);
    }

    #[test]
    fn action_code_law_holds() {
        assert_eq!(third_action_byte(0x41), 0xA0);
        assert_eq!(third_action_byte(0x42), 0x21);
    }

    fn third_action_byte(action: u8) -> u8 {
        ((action >> 1) & 0x7F) | ((action << 7) & 0x80)
    }

    proptest::proptest! {
        #[test]
        fn packet_round_trip_prop(
            psid in proptest::prelude::any::<u8>(),
            ssid in proptest::prelude::any::<u8>(),
            credit in proptest::prelude::any::<u8>(),
            control in proptest::prelude::any::<u8>(),
            payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..256),
        ) {
            let packet = D4Packet::new(psid, ssid, credit, control, payload);
            let encoded = packet.encode();
            let mut header = [0u8; HEADER_LEN];
            header.copy_from_slice(&encoded[..HEADER_LEN]);
            let decoded = D4Packet::decode(&header, encoded[HEADER_LEN..].to_vec());
            proptest::prop_assert_eq!(packet, decoded);
        }

        #[test]
        fn credit_conservation_prop(
            initial_tx in 0i64..10,
            grants in proptest::collection::vec(0u8..=5, 0..20),
        ) {
            // Simulates a channel receiving `grants.len()` packets, each
            // carrying a `credit` field, while sending one packet per
            // received packet (a simple request/response ping-pong).
            let mut tx_credits = initial_tx;
            let mut sent = 0i64;
            let mut received_credit_sum = 0i64;
            for &grant in &grants {
                tx_credits += grant as i64;
                received_credit_sum += grant as i64;
                if tx_credits >= 1 {
                    tx_credits -= 1;
                    sent += 1;
                }
                proptest::prop_assert!(tx_credits >= 0);
            }
            proptest::prop_assert_eq!(tx_credits, initial_tx + received_credit_sum - sent);
        }
    }
}
