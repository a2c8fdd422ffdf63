//! tokio based IO for the [`IceAgent`]

use crate::{Component, IceAgent, IceEvent, ReceivedPkt, StreamId};
use quinn_udp::{BATCH_SIZE, RecvMeta};
use socket::Socket;
use std::{
    collections::{HashMap, VecDeque},
    future::poll_fn,
    io::{self, IoSliceMut},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
};
use tokio::{
    net::UdpSocket,
    time::{Sleep, sleep_until},
};

mod socket;

const RECV_BUFFER_SIZE: usize = 2500;

/// Sockets and timers driving an [`IceAgent`]
///
/// Performs all [`IceEvent::SendData`] events of the agent, every other event is returned from
/// [`TokioIceIo::poll_agent`].
pub struct TokioIceIo {
    ips: Vec<IpAddr>,
    sockets: HashMap<(StreamId, Component), Socket>,
    sleep: Option<Pin<Box<Sleep>>>,
    events: VecDeque<IceEvent>,

    bufs: Box<[[u8; RECV_BUFFER_SIZE]; BATCH_SIZE]>,
    meta: Box<[RecvMeta; BATCH_SIZE]>,
}

impl TokioIceIo {
    /// Create a new state with a list of local IP addresses, which are used as host candidates
    pub fn new(ips: Vec<IpAddr>) -> Self {
        Self {
            ips,
            sockets: HashMap::new(),
            sleep: Some(Box::pin(sleep_until(Instant::now().into()))),
            events: VecDeque::new(),
            bufs: Box::new([[0u8; RECV_BUFFER_SIZE]; BATCH_SIZE]),
            meta: Box::new([RecvMeta::default(); BATCH_SIZE]),
        }
    }

    /// Create a new state and discover a list of local IP addresses
    pub fn new_with_local_ips() -> Result<Self, local_ip_address::Error> {
        let ips = local_ip_address::list_afinet_netifas()?
            .into_iter()
            .map(|(_, addr)| addr)
            .collect();

        Ok(Self::new(ips))
    }

    /// Bind a socket for the component and register its addresses as host addresses of the agent
    ///
    /// Returns the local address of the socket.
    pub async fn bind(
        &mut self,
        agent: &mut IceAgent,
        stream: StreamId,
        component: Component,
    ) -> io::Result<SocketAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let local_addr = socket.local_addr()?;

        for ip in self.ips.iter().filter(|ip| ip.is_ipv4()) {
            agent
                .add_host_addr(stream, component, SocketAddr::new(*ip, local_addr.port()))
                .map_err(io::Error::other)?;
        }

        self.sockets.insert((stream, component), Socket::new(socket)?);

        Ok(local_addr)
    }

    /// Close the sockets of a stream
    pub fn remove_stream(&mut self, stream: StreamId) {
        self.sockets.retain(|(s, _), _| *s != stream);
    }

    /// Send data on the selected pair of the component
    pub fn send(
        &mut self,
        agent: &mut IceAgent,
        stream: StreamId,
        component: Component,
        data: Vec<u8>,
    ) -> Result<(), crate::Error> {
        agent.send(stream, component, data)?;
        self.drain_events(agent);

        Ok(())
    }

    fn send_data(
        &mut self,
        stream: StreamId,
        component: Component,
        data: Vec<u8>,
        source: Option<IpAddr>,
        target: SocketAddr,
    ) {
        if let Some(socket) = self.sockets.get_mut(&(stream, component)) {
            socket.enqueue(data, source, target);
        } else {
            log::error!(
                "Tried to send packet using a non existent socket {stream:?} {component:?}"
            );
        }
    }

    fn drain_events(&mut self, agent: &mut IceAgent) {
        while let Some(event) = agent.pop_event() {
            match event {
                IceEvent::SendData {
                    stream,
                    component,
                    data,
                    source,
                    target,
                } => self.send_data(stream, component, data, source, target),
                event => self.events.push_back(event),
            }
        }
    }

    /// Poll the agent until an event is received.
    ///
    /// This function is cancel safe.
    pub async fn poll_agent(&mut self, agent: &mut IceAgent) -> io::Result<IceEvent> {
        self.drain_events(agent);

        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }

        poll_fn(|cx| self.poll(cx, agent)).await
    }

    /// Poll the internal IO and agent.
    ///
    /// Returns `Poll::Ready` with the next event of the agent.
    pub fn poll(&mut self, cx: &mut Context<'_>, agent: &mut IceAgent) -> Poll<io::Result<IceEvent>> {
        let now = Instant::now();

        self.drain_events(agent);

        let mut received = false;

        for ((stream, component), socket) in self.sockets.iter_mut() {
            socket.send_pending(cx);

            while let Poll::Ready(result) = {
                let mut slices = self.bufs.each_mut().map(|buf| IoSliceMut::new(buf));

                socket.poll_recv_from(cx, &mut slices, &mut *self.meta)
            } {
                let num_msg = result?;

                for i in 0..num_msg {
                    let len = self.meta[i].len;

                    let pkt = ReceivedPkt {
                        data: self.bufs[i][..len].to_vec(),
                        source: self.meta[i].addr,
                        destination: self.meta[i].dst_ip.map_or(socket.local_addr(), |ip| {
                            (ip, socket.local_addr().port()).into()
                        }),
                        stream: *stream,
                        component: *component,
                    };

                    agent.receive(now, pkt);

                    received = true;
                }
            }
        }

        // Don't attempt to poll the agent if theres too many outbound packets queued
        if self.sockets.values().any(Socket::queue_is_full) {
            return Poll::Pending;
        }

        // Polled without IO being the reason, ignore sleep and poll agent once
        if !received {
            agent.poll(now);

            self.update_sleep(agent, now);
        }

        // Poll sleep until it returns pending, to register the sleep with the context
        while let Some(sleep) = &mut self.sleep
            && sleep.as_mut().poll(cx).is_ready()
        {
            agent.poll(now);

            self.update_sleep(agent, now);
        }

        self.drain_events(agent);

        // Packets enqueued by this poll
        for socket in self.sockets.values_mut() {
            socket.send_pending(cx);
        }

        match self.events.pop_front() {
            Some(event) => Poll::Ready(Ok(event)),
            None => Poll::Pending,
        }
    }

    fn update_sleep(&mut self, agent: &mut IceAgent, now: Instant) {
        match agent.timeout(now) {
            Some(duration) => {
                // Never busy loop on a deadline that is due
                let duration = duration.max(Duration::from_millis(1));
                let deadline = tokio::time::Instant::from(now + duration);

                if let Some(sleep) = &mut self.sleep {
                    sleep.as_mut().reset(deadline);
                } else {
                    self.sleep = Some(Box::pin(sleep_until(deadline)))
                }
            }
            None => self.sleep = None,
        }
    }
}
