//! 推論エンジンのプール
//!
//! 同時リクエスト数が多くてもエンジンの数は固定です。
//! 空きがないときは返却されるまで待ちます。

use std::ops::Deref;

use parking_lot::{Condvar, Mutex};

pub struct EnginePool<T> {
    idle: Mutex<Vec<T>>,
    available: Condvar,
}

impl<T> EnginePool<T> {
    pub fn new(engines: Vec<T>) -> Self {
        Self {
            idle: Mutex::new(engines),
            available: Condvar::new(),
        }
    }

    /// 現在貸し出し可能なエンジン数
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// エンジンを1つ借りる（空くまでブロック）
    ///
    /// 返されたガードがdropされるとエンジンはプールに戻ります。
    pub fn checkout(&self) -> PooledEngine<'_, T> {
        let mut idle = self.idle.lock();
        loop {
            if let Some(engine) = idle.pop() {
                return PooledEngine {
                    pool: self,
                    engine: Some(engine),
                };
            }
            self.available.wait(&mut idle);
        }
    }

    fn give_back(&self, engine: T) {
        self.idle.lock().push(engine);
        self.available.notify_one();
    }
}

/// 貸し出し中のエンジン
pub struct PooledEngine<'a, T> {
    pool: &'a EnginePool<T>,
    engine: Option<T>,
}

impl<T> Deref for PooledEngine<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // engineはdropまで必ずSome
        match &self.engine {
            Some(engine) => engine,
            None => unreachable!("pooled engine already returned"),
        }
    }
}

impl<T> Drop for PooledEngine<'_, T> {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            self.pool.give_back(engine);
        }
    }
}
