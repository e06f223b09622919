//! 打开闸门
//!
//! 串行化并发的 open；任何非 open 操作在首次调用前隐式打开；close 后复位。

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::DelegatingHandler;
use super::fault::ClassifiedFault;
use crate::transport::Message;

pub struct GatekeeperHandler {
    inner: Arc<dyn DelegatingHandler>,
    opened: Mutex<bool>,
}

impl GatekeeperHandler {
    pub fn new(inner: Arc<dyn DelegatingHandler>) -> Self {
        Self {
            inner,
            opened: Mutex::new(false),
        }
    }

    pub async fn is_open(&self) -> bool {
        *self.opened.lock().await
    }

    async fn ensure_open(&self, cancel: &CancellationToken) -> Result<(), ClassifiedFault> {
        let mut opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClassifiedFault::canceled("等待打开时被取消")),
            guard = self.opened.lock() => guard,
        };
        if !*opened {
            self.inner.open(cancel).await?;
            *opened = true;
            debug!("管道已打开");
        }
        Ok(())
    }
}

#[async_trait]
impl DelegatingHandler for GatekeeperHandler {
    async fn open(&self, cancel: &CancellationToken) -> Result<(), ClassifiedFault> {
        self.ensure_open(cancel).await
    }

    async fn send_event(
        &self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedFault> {
        self.ensure_open(cancel).await?;
        self.inner.send_event(message, cancel).await
    }

    async fn send_events(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedFault> {
        self.ensure_open(cancel).await?;
        self.inner.send_events(messages, cancel).await
    }

    async fn receive(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Message>, ClassifiedFault> {
        self.ensure_open(cancel).await?;
        self.inner.receive(timeout, cancel).await
    }

    async fn complete(
        &self,
        lock_token: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedFault> {
        self.ensure_open(cancel).await?;
        self.inner.complete(lock_token, cancel).await
    }

    async fn abandon(
        &self,
        lock_token: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedFault> {
        self.ensure_open(cancel).await?;
        self.inner.abandon(lock_token, cancel).await
    }

    async fn reject(
        &self,
        lock_token: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedFault> {
        self.ensure_open(cancel).await?;
        self.inner.reject(lock_token, cancel).await
    }

    async fn close(&self, cancel: &CancellationToken) -> Result<(), ClassifiedFault> {
        let mut opened = self.opened.lock().await;
        if !*opened {
            return Ok(());
        }
        *opened = false;
        self.inner.close(cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        opens: AtomicU32,
        sends: AtomicU32,
        closes: AtomicU32,
    }

    #[async_trait]
    impl DelegatingHandler for CountingHandler {
        async fn open(&self, _cancel: &CancellationToken) -> Result<(), ClassifiedFault> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send_event(
            &self,
            _message: &Message,
            _cancel: &CancellationToken,
        ) -> Result<(), ClassifiedFault> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send_events(
            &self,
            _messages: &[Message],
            _cancel: &CancellationToken,
        ) -> Result<(), ClassifiedFault> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn receive(
            &self,
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> Result<Option<Message>, ClassifiedFault> {
            Ok(None)
        }

        async fn complete(
            &self,
            _lock_token: &str,
            _cancel: &CancellationToken,
        ) -> Result<(), ClassifiedFault> {
            Ok(())
        }

        async fn abandon(
            &self,
            _lock_token: &str,
            _cancel: &CancellationToken,
        ) -> Result<(), ClassifiedFault> {
            Ok(())
        }

        async fn reject(
            &self,
            _lock_token: &str,
            _cancel: &CancellationToken,
        ) -> Result<(), ClassifiedFault> {
            Ok(())
        }

        async fn close(&self, _cancel: &CancellationToken) -> Result<(), ClassifiedFault> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_opens_are_serialized() {
        let inner = Arc::new(CountingHandler::default());
        let gate = Arc::new(GatekeeperHandler::new(inner.clone()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.open(&CancellationToken::new()).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(inner.opens.load(Ordering::SeqCst), 1);
        assert!(gate.is_open().await);
    }

    #[tokio::test]
    async fn test_implicit_open_and_reset_on_close() {
        let inner = Arc::new(CountingHandler::default());
        let gate = GatekeeperHandler::new(inner.clone());
        let cancel = CancellationToken::new();

        gate.send_event(&Message::new("x"), &cancel).await.unwrap();
        gate.send_event(&Message::new("y"), &cancel).await.unwrap();
        assert_eq!(inner.opens.load(Ordering::SeqCst), 1);
        assert_eq!(inner.sends.load(Ordering::SeqCst), 2);

        gate.close(&cancel).await.unwrap();
        gate.close(&cancel).await.unwrap();
        assert_eq!(inner.closes.load(Ordering::SeqCst), 1);

        gate.send_events(&[Message::new("z")], &cancel).await.unwrap();
        assert_eq!(inner.opens.load(Ordering::SeqCst), 2);
    }
}
