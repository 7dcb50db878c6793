use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace};

/// A recycling pool for payload buffers, amortizing allocation under
///  sustained throughput. A borrowed buffer finds its way back into the pool
///  when it is dropped, so callbacks can hold on to it for as long as they
///  need without an explicit return call.
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    buf_capacity: usize,
    max_pooled: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(buf_capacity: usize, max_pooled: usize) -> BufferPool {
        BufferPool {
            inner: Arc::new(PoolInner {
                buf_capacity,
                max_pooled,
                buffers: Mutex::new(Vec::with_capacity(max_pooled)),
            }),
        }
    }

    pub fn get(&self) -> PooledBuf {
        let buf = {
            let mut buffers = self.inner.buffers.lock().unwrap();
            buffers.pop()
        };

        let buf = match buf {
            Some(buf) => {
                trace!("returning buffer from pool");
                buf
            }
            None => {
                debug!("no buffer in pool: creating new buffer");
                Vec::with_capacity(self.inner.buf_capacity)
            }
        };

        PooledBuf {
            buf: Some(buf),
            pool: Arc::downgrade(&self.inner),
        }
    }

    #[cfg(test)]
    fn pooled_count(&self) -> usize {
        self.inner.buffers.lock().unwrap().len()
    }
}

pub struct PooledBuf {
    buf: Option<Vec<u8>>,
    pool: Weak<PoolInner>,
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        self.buf.as_ref().expect("buffer is present until drop")
    }
}
impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("buffer is present until drop")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let mut buf = self.buf.take().expect("buffer is present until drop");

        let Some(pool) = self.pool.upgrade() else {
            return; // the pool is gone, just free the buffer
        };

        buf.clear();
        let mut buffers = pool.buffers.lock().unwrap();
        if buffers.len() < pool.max_pooled {
            trace!("returning buffer to pool");
            buffers.push(buf);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}
