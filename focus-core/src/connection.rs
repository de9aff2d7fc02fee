//! The focus's own XMPP WebSocket transport: connects, authenticates,
//! binds a resource, and then dispatches every inbound stanza to whichever
//! registered `StanzaFilter` claims it.

use std::{convert::TryFrom, fmt, future::Future, sync::Arc};

use anyhow::{anyhow, bail, Context, Result};
use futures::{
  sink::{Sink, SinkExt},
  stream::{Stream, StreamExt, TryStreamExt},
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::{
  http::{Request, Uri},
  Message,
};
use tracing::{debug, error, info, warn};
use xmpp_parsers::{
  bind::{BindQuery, BindResponse},
  iq::{Iq, IqType},
  sasl::{Auth, Mechanism, Success},
  websocket::Open,
  BareJid, Element, FullJid, Jid,
};

use crate::{pinger::Pinger, stanza_filter::StanzaFilter, tls::wss_connector, util::generate_id};

/// How the focus authenticates to the XMPP server it is a component/client of.
#[derive(Debug, Clone)]
pub enum Authentication {
  Anonymous,
  Plain { username: String, password: String },
  Jwt { token: String },
}

#[derive(Debug, Clone, Copy)]
enum ConnectionState {
  OpeningPreAuthentication,
  ReceivingFeaturesPreAuthentication,
  Authenticating,
  OpeningPostAuthentication,
  ReceivingFeaturesPostAuthentication,
  Binding,
  Idle,
}

struct ConnectionInner {
  state: ConnectionState,
  xmpp_domain: BareJid,
  authentication: Authentication,
  jid: Option<FullJid>,
  connected_tx: Option<oneshot::Sender<Result<()>>>,
  stanza_filters: Vec<Box<dyn StanzaFilter + Send + Sync>>,
}

impl fmt::Debug for ConnectionInner {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConnectionInner")
      .field("state", &self.state)
      .field("xmpp_domain", &self.xmpp_domain)
      .field("jid", &self.jid)
      .finish()
  }
}

#[derive(Debug, Clone)]
pub struct Connection {
  tx: mpsc::Sender<Element>,
  inner: Arc<Mutex<ConnectionInner>>,
}

impl Connection {
  pub async fn new(
    websocket_url: &str,
    xmpp_domain: &str,
    authentication: Authentication,
    tls_insecure: bool,
  ) -> Result<(Self, impl Future<Output = ()>)> {
    let websocket_url: Uri = websocket_url.parse().context("invalid WebSocket URL")?;
    let xmpp_domain: BareJid = xmpp_domain.parse().context("invalid XMPP domain")?;

    info!("Connecting XMPP WebSocket to {}", websocket_url);
    let request = Request::get(websocket_url)
      .header("Sec-Websocket-Protocol", "xmpp")
      .body(())
      .context("failed to build WebSocket request")?;
    let connector = wss_connector(tls_insecure)?;
    let (websocket, _response) =
      tokio_tungstenite::connect_async_tls_with_config(request, None, false, Some(connector))
        .await
        .context("failed to connect XMPP WebSocket")?;
    let (sink, stream) = websocket.split();
    let (tx, rx) = mpsc::channel(64);

    let inner = Arc::new(Mutex::new(ConnectionInner {
      state: ConnectionState::OpeningPreAuthentication,
      xmpp_domain,
      authentication,
      jid: None,
      connected_tx: None,
      stanza_filters: vec![],
    }));

    let connection = Self { tx: tx.clone(), inner: inner.clone() };

    let writer = Connection::write_loop(rx, sink);
    let reader = Connection::read_loop(inner, tx, stream);

    let background = async move {
      tokio::select! {
        res = reader => if let Err(e) = res { error!("fatal (in read loop): {:?}", e) },
        res = writer => if let Err(e) = res { error!("fatal (in write loop): {:?}", e) },
      }
    };

    Ok((connection, background))
  }

  pub async fn connect(&self) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    {
      let mut locked_inner = self.inner.lock().await;
      locked_inner.connected_tx = Some(tx);
      let open = Open::new(locked_inner.xmpp_domain.clone());
      self.tx.send(open.into()).await?;
    }
    rx.await?
  }

  pub async fn jid(&self) -> Option<FullJid> {
    self.inner.lock().await.jid.clone()
  }

  pub fn sender(&self) -> mpsc::Sender<Element> {
    self.tx.clone()
  }

  pub async fn register_stanza_filter(&self, filter: Box<dyn StanzaFilter + Send + Sync>) {
    self.inner.lock().await.stanza_filters.push(filter);
  }

  async fn write_loop<S>(rx: mpsc::Receiver<Element>, mut sink: S) -> Result<()>
  where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
  {
    let mut rx = ReceiverStream::new(rx);
    while let Some(element) = rx.next().await {
      let mut bytes = Vec::new();
      element.write_to(&mut bytes)?;
      let xml = String::from_utf8(bytes)?;
      debug!("XMPP    >>> {}", xml);
      sink.send(Message::Text(xml)).await?;
    }
    Ok(())
  }

  async fn read_loop<S>(
    inner: Arc<Mutex<ConnectionInner>>,
    tx: mpsc::Sender<Element>,
    mut stream: S,
  ) -> Result<()>
  where
    S: Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
  {
    loop {
      let message = stream.try_next().await?.ok_or_else(|| anyhow!("unexpected EOF"))?;
      let element: Element = match message {
        Message::Text(xml) => {
          debug!("XMPP    <<< {}", xml);
          xml.parse()?
        },
        _ => {
          warn!("unexpected non-text message on XMPP WebSocket stream: {:?}", message);
          continue;
        },
      };

      let mut locked_inner = inner.lock().await;

      use ConnectionState::*;
      match locked_inner.state {
        OpeningPreAuthentication => {
          Open::try_from(element)?;
          info!("Connected XMPP WebSocket");
          locked_inner.state = ReceivingFeaturesPreAuthentication;
        },
        ReceivingFeaturesPreAuthentication => {
          let auth = match &locked_inner.authentication {
            Authentication::Anonymous => Auth { mechanism: Mechanism::Anonymous, data: vec![] },
            Authentication::Plain { username, password } => Auth {
              mechanism: Mechanism::Plain,
              data: format!("\0{}\0{}", username, password).into_bytes(),
            },
            // Jitsi's token-auth Prosody module accepts a JWT as the SASL PLAIN password.
            Authentication::Jwt { token } => {
              Auth { mechanism: Mechanism::Plain, data: format!("\0{}", token).into_bytes() }
            },
          };
          tx.send(auth.into()).await?;
          locked_inner.state = Authenticating;
        },
        Authenticating => {
          Success::try_from(element)?;
          let open = Open::new(locked_inner.xmpp_domain.clone());
          tx.send(open.into()).await?;
          locked_inner.state = OpeningPostAuthentication;
        },
        OpeningPostAuthentication => {
          Open::try_from(element)?;
          info!("Logged in");
          locked_inner.state = ReceivingFeaturesPostAuthentication;
        },
        ReceivingFeaturesPostAuthentication => {
          let iq = Iq::from_set(generate_id(), BindQuery::new(None));
          tx.send(iq.into()).await?;
          locked_inner.state = Binding;
        },
        Binding => {
          let iq = Iq::try_from(element)?;
          let jid = if let IqType::Result(Some(element)) = iq.payload {
            let bind = BindResponse::try_from(element)?;
            FullJid::try_from(bind)?
          } else {
            bail!("bind failed");
          };
          info!("My JID: {}", jid);
          locked_inner.jid = Some(jid.clone());

          locked_inner
            .stanza_filters
            .push(Box::new(Pinger { jid: jid.clone(), tx: tx.clone() }));

          if let Some(tx) = locked_inner.connected_tx.take() {
            tx.send(Ok(())).map_err(|_| anyhow!("channel closed"))?;
          }
          locked_inner.state = Idle;
        },
        Idle => {
          for filter in &locked_inner.stanza_filters {
            if filter.filter(&element) {
              filter.take(element).await?;
              break;
            }
          }
        },
      }
    }
  }
}

/// `jid` is addressed as bare because the focus may not yet have bound a
/// resource when building an early outgoing stanza.
pub fn bare(jid: &Jid) -> BareJid {
  match jid {
    Jid::Bare(b) => b.clone(),
    Jid::Full(f) => f.clone().into(),
  }
}
