use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::buf::{put_string, try_get_string};

/// wire tag of a registration sample
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
enum CmdType {
    RegisterPublisher = 2,
    RegisterSubscriber = 3,
    RegisterProcess = 4,
    RegisterService = 5,
    RegisterClient = 6,
    UnregisterPublisher = 12,
    UnregisterSubscriber = 13,
    UnregisterProcess = 14,
    UnregisterService = 15,
    UnregisterClient = 16,
}

/// composite key for the provider-side entity maps
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct EntityKey {
    pub name: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> EntityKey {
        EntityKey {
            name: name.into(),
            id: id.into(),
        }
    }
}


#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProcessDescriptor {
    pub host_name: String,
    pub pid: i32,
    pub process_name: String,
    pub unit_name: String,
    pub read_bytes_per_sec: u64,
    pub write_bytes_per_sec: u64,
}

impl ProcessDescriptor {
    fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, &self.host_name);
        buf.put_i32(self.pid);
        put_string(buf, &self.process_name);
        put_string(buf, &self.unit_name);
        buf.put_u64(self.read_bytes_per_sec);
        buf.put_u64(self.write_bytes_per_sec);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ProcessDescriptor> {
        Ok(ProcessDescriptor {
            host_name: try_get_string(buf)?,
            pid: buf.try_get_i32()?,
            process_name: try_get_string(buf)?,
            unit_name: try_get_string(buf)?,
            read_bytes_per_sec: buf.try_get_u64()?,
            write_bytes_per_sec: buf.try_get_u64()?,
        })
    }
}


#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TopicDescriptor {
    pub host_name: String,
    pub pid: i32,
    pub process_name: String,
    pub unit_name: String,
    pub topic_name: String,
    pub topic_id: String,
    pub encoding: String,
    pub type_name: String,
    pub topic_size: i32,
    pub connections_local: i32,
    pub connections_external: i32,
    /// incremented for every published payload
    pub data_clock: i64,
    /// incremented for every re-registration, so consumers can tell a
    ///  refresh from a replayed old sample
    pub registration_clock: i32,
}

impl TopicDescriptor {
    fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, &self.host_name);
        buf.put_i32(self.pid);
        put_string(buf, &self.process_name);
        put_string(buf, &self.unit_name);
        put_string(buf, &self.topic_name);
        put_string(buf, &self.topic_id);
        put_string(buf, &self.encoding);
        put_string(buf, &self.type_name);
        buf.put_i32(self.topic_size);
        buf.put_i32(self.connections_local);
        buf.put_i32(self.connections_external);
        buf.put_i64(self.data_clock);
        buf.put_i32(self.registration_clock);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<TopicDescriptor> {
        Ok(TopicDescriptor {
            host_name: try_get_string(buf)?,
            pid: buf.try_get_i32()?,
            process_name: try_get_string(buf)?,
            unit_name: try_get_string(buf)?,
            topic_name: try_get_string(buf)?,
            topic_id: try_get_string(buf)?,
            encoding: try_get_string(buf)?,
            type_name: try_get_string(buf)?,
            topic_size: buf.try_get_i32()?,
            connections_local: buf.try_get_i32()?,
            connections_external: buf.try_get_i32()?,
            data_clock: buf.try_get_i64()?,
            registration_clock: buf.try_get_i32()?,
        })
    }
}


#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MethodDescriptor {
    pub method_name: String,
    pub request_type: String,
    pub response_type: String,
}

impl MethodDescriptor {
    fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, &self.method_name);
        put_string(buf, &self.request_type);
        put_string(buf, &self.response_type);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MethodDescriptor> {
        Ok(MethodDescriptor {
            method_name: try_get_string(buf)?,
            request_type: try_get_string(buf)?,
            response_type: try_get_string(buf)?,
        })
    }
}


#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServiceDescriptor {
    pub host_name: String,
    pub pid: i32,
    pub process_name: String,
    pub unit_name: String,
    pub service_name: String,
    pub service_id: String,
    /// where the service accepts connections
    pub tcp_port: u16,
    pub methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, &self.host_name);
        buf.put_i32(self.pid);
        put_string(buf, &self.process_name);
        put_string(buf, &self.unit_name);
        put_string(buf, &self.service_name);
        put_string(buf, &self.service_id);
        buf.put_u16(self.tcp_port);
        buf.put_usize_varint(self.methods.len());
        for method in &self.methods {
            method.ser(buf);
        }
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ServiceDescriptor> {
        let host_name = try_get_string(buf)?;
        let pid = buf.try_get_i32()?;
        let process_name = try_get_string(buf)?;
        let unit_name = try_get_string(buf)?;
        let service_name = try_get_string(buf)?;
        let service_id = try_get_string(buf)?;
        let tcp_port = buf.try_get_u16()?;

        let num_methods = buf.try_get_usize_varint()?;
        let mut methods = Vec::new();
        for _ in 0..num_methods {
            methods.push(MethodDescriptor::try_deser(buf)?);
        }

        Ok(ServiceDescriptor {
            host_name,
            pid,
            process_name,
            unit_name,
            service_name,
            service_id,
            tcp_port,
            methods,
        })
    }
}


#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClientDescriptor {
    pub host_name: String,
    pub pid: i32,
    pub process_name: String,
    pub unit_name: String,
    pub service_name: String,
    pub client_id: String,
}

impl ClientDescriptor {
    fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, &self.host_name);
        buf.put_i32(self.pid);
        put_string(buf, &self.process_name);
        put_string(buf, &self.unit_name);
        put_string(buf, &self.service_name);
        put_string(buf, &self.client_id);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ClientDescriptor> {
        Ok(ClientDescriptor {
            host_name: try_get_string(buf)?,
            pid: buf.try_get_i32()?,
            process_name: try_get_string(buf)?,
            unit_name: try_get_string(buf)?,
            service_name: try_get_string(buf)?,
            client_id: try_get_string(buf)?,
        })
    }
}


/// One unit of registration traffic. Register and unregister are distinct
///  variants rather than a flag so that handling code has to make a
///  conscious decision for each - a new sample kind cannot be silently
///  ignored.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Sample {
    RegisterProcess(ProcessDescriptor),
    UnregisterProcess(ProcessDescriptor),
    RegisterPublisher(TopicDescriptor),
    UnregisterPublisher(TopicDescriptor),
    RegisterSubscriber(TopicDescriptor),
    UnregisterSubscriber(TopicDescriptor),
    RegisterService(ServiceDescriptor),
    UnregisterService(ServiceDescriptor),
    RegisterClient(ClientDescriptor),
    UnregisterClient(ClientDescriptor),
}

impl Sample {
    fn cmd_type(&self) -> CmdType {
        match self {
            Sample::RegisterProcess(_) => CmdType::RegisterProcess,
            Sample::UnregisterProcess(_) => CmdType::UnregisterProcess,
            Sample::RegisterPublisher(_) => CmdType::RegisterPublisher,
            Sample::UnregisterPublisher(_) => CmdType::UnregisterPublisher,
            Sample::RegisterSubscriber(_) => CmdType::RegisterSubscriber,
            Sample::UnregisterSubscriber(_) => CmdType::UnregisterSubscriber,
            Sample::RegisterService(_) => CmdType::RegisterService,
            Sample::UnregisterService(_) => CmdType::UnregisterService,
            Sample::RegisterClient(_) => CmdType::RegisterClient,
            Sample::UnregisterClient(_) => CmdType::UnregisterClient,
        }
    }

    /// the name under which this sample travels on the wire - what receivers
    ///  base their interest decision on
    pub fn sample_name(&self) -> &str {
        match self {
            Sample::RegisterProcess(p) | Sample::UnregisterProcess(p) => &p.host_name,
            Sample::RegisterPublisher(t) | Sample::UnregisterPublisher(t)
            | Sample::RegisterSubscriber(t) | Sample::UnregisterSubscriber(t) => &t.topic_name,
            Sample::RegisterService(s) | Sample::UnregisterService(s) => &s.service_name,
            Sample::RegisterClient(c) | Sample::UnregisterClient(c) => &c.service_name,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_i32(self.cmd_type().into());
        match self {
            Sample::RegisterProcess(p) | Sample::UnregisterProcess(p) => p.ser(buf),
            Sample::RegisterPublisher(t) | Sample::UnregisterPublisher(t)
            | Sample::RegisterSubscriber(t) | Sample::UnregisterSubscriber(t) => t.ser(buf),
            Sample::RegisterService(s) | Sample::UnregisterService(s) => s.ser(buf),
            Sample::RegisterClient(c) | Sample::UnregisterClient(c) => c.ser(buf),
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Sample> {
        let cmd_type = CmdType::try_from(buf.try_get_i32()?)?;

        let sample = match cmd_type {
            CmdType::RegisterProcess => Sample::RegisterProcess(ProcessDescriptor::try_deser(buf)?),
            CmdType::UnregisterProcess => Sample::UnregisterProcess(ProcessDescriptor::try_deser(buf)?),
            CmdType::RegisterPublisher => Sample::RegisterPublisher(TopicDescriptor::try_deser(buf)?),
            CmdType::UnregisterPublisher => Sample::UnregisterPublisher(TopicDescriptor::try_deser(buf)?),
            CmdType::RegisterSubscriber => Sample::RegisterSubscriber(TopicDescriptor::try_deser(buf)?),
            CmdType::UnregisterSubscriber => Sample::UnregisterSubscriber(TopicDescriptor::try_deser(buf)?),
            CmdType::RegisterService => Sample::RegisterService(ServiceDescriptor::try_deser(buf)?),
            CmdType::UnregisterService => Sample::UnregisterService(ServiceDescriptor::try_deser(buf)?),
            CmdType::RegisterClient => Sample::RegisterClient(ClientDescriptor::try_deser(buf)?),
            CmdType::UnregisterClient => Sample::UnregisterClient(ClientDescriptor::try_deser(buf)?),
        };
        Ok(sample)
    }
}


/// All samples of one refresh cycle batched into one block, for broadcast
///  domains where a single large write is much cheaper than one datagram
///  per sample.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SampleList {
    pub samples: Vec<Sample>,
}

impl SampleList {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_usize_varint(self.samples.len());
        for sample in &self.samples {
            sample.ser(buf);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<SampleList> {
        let num_samples = buf.try_get_usize_varint()?;

        let mut samples = Vec::new();
        for _ in 0..num_samples {
            samples.push(Sample::try_deser(buf)?);
        }
        if buf.has_remaining() {
            bail!("{} trailing bytes after the last sample of a list", buf.remaining());
        }

        Ok(SampleList { samples })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    pub fn topic_descriptor(topic_name: &str) -> TopicDescriptor {
        TopicDescriptor {
            host_name: "host_a".to_string(),
            pid: 4711,
            process_name: "proc".to_string(),
            unit_name: "unit".to_string(),
            topic_name: topic_name.to_string(),
            topic_id: "42".to_string(),
            encoding: "raw".to_string(),
            type_name: "blob".to_string(),
            topic_size: 1024,
            connections_local: 1,
            connections_external: 2,
            data_clock: 99,
            registration_clock: 3,
        }
    }

    fn service_descriptor() -> ServiceDescriptor {
        ServiceDescriptor {
            host_name: "host_a".to_string(),
            pid: 4711,
            process_name: "proc".to_string(),
            unit_name: "unit".to_string(),
            service_name: "mirror".to_string(),
            service_id: "7".to_string(),
            tcp_port: 31337,
            methods: vec![
                MethodDescriptor {
                    method_name: "echo".to_string(),
                    request_type: "bytes".to_string(),
                    response_type: "bytes".to_string(),
                },
            ],
        }
    }

    #[rstest]
    #[case::process(Sample::RegisterProcess(ProcessDescriptor {
        host_name: "host_a".to_string(),
        pid: 4711,
        process_name: "proc".to_string(),
        unit_name: "unit".to_string(),
        read_bytes_per_sec: 1000,
        write_bytes_per_sec: 2000,
    }), "host_a")]
    #[case::publisher(Sample::RegisterPublisher(topic_descriptor("topic_a")), "topic_a")]
    #[case::unregister_subscriber(Sample::UnregisterSubscriber(topic_descriptor("topic_b")), "topic_b")]
    #[case::service(Sample::RegisterService(service_descriptor()), "mirror")]
    #[case::client(Sample::UnregisterClient(ClientDescriptor {
        host_name: "host_b".to_string(),
        pid: 1,
        process_name: "p".to_string(),
        unit_name: "u".to_string(),
        service_name: "mirror".to_string(),
        client_id: "11".to_string(),
    }), "mirror")]
    fn test_sample_roundtrip(#[case] sample: Sample, #[case] expected_name: &str) {
        assert_eq!(sample.sample_name(), expected_name);

        let mut buf = BytesMut::new();
        sample.ser(&mut buf);

        let mut read_buf: &[u8] = &buf;
        let deserialized = Sample::try_deser(&mut read_buf).unwrap();
        assert!(read_buf.is_empty());
        assert_eq!(deserialized, sample);
    }

    #[rstest]
    #[case::unknown_cmd_type(vec![0, 0, 0, 99])]
    #[case::truncated_descriptor(vec![0, 0, 0, 4, 3, b'a'])]
    #[case::empty(vec![])]
    fn test_sample_deser_rejects(#[case] raw: Vec<u8>) {
        let mut buf: &[u8] = &raw;
        assert!(Sample::try_deser(&mut buf).is_err());
    }

    #[test]
    fn test_sample_list_roundtrip() {
        let list = SampleList {
            samples: vec![
                Sample::RegisterPublisher(topic_descriptor("topic_a")),
                Sample::RegisterService(service_descriptor()),
            ],
        };

        let mut buf = BytesMut::new();
        list.ser(&mut buf);

        let mut read_buf: &[u8] = &buf;
        assert_eq!(SampleList::try_deser(&mut read_buf).unwrap(), list);
    }

    #[test]
    fn test_sample_list_rejects_trailing_garbage() {
        let mut buf = BytesMut::new();
        SampleList { samples: vec![] }.ser(&mut buf);
        buf.put_u8(42);

        let mut read_buf: &[u8] = &buf;
        assert!(SampleList::try_deser(&mut read_buf).is_err());
    }
}
