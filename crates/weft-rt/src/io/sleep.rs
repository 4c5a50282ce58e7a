// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `sleep`: suspend the caller on a timer.

use std::rc::Rc;
use std::time::Duration;

use log::debug;

use crate::co::{Co, CoOp};
use crate::error::ApiError;
use crate::phase::resume_after_io;

impl Co {
    /// Suspend for `delay`. A zero delay still yields and resumes through
    /// the timer queue.
    pub async fn sleep(&self, delay: Duration) -> Result<(), ApiError> {
        self.arm_sleep(delay)?;
        self.suspend().await;
        Ok(())
    }

    /// `sleep` with a delay in (fractional) seconds.
    pub async fn sleep_secs(&self, secs: f64) -> Result<(), ApiError> {
        if !secs.is_finite() || secs < 0.0 {
            return Err(ApiError::InvalidSleep);
        }
        let delay = Duration::try_from_secs_f64(secs).map_err(|_| ApiError::InvalidSleep)?;
        self.sleep(delay).await
    }

    fn arm_sleep(&self, delay: Duration) -> Result<(), ApiError> {
        let req = self.check_yieldable()?;
        let rt = req.runtime();
        let id = self.id();
        req.cleanup_pending_operation(id);

        let waker = req.clone();
        let timer = rt.add_timer(delay, move || {
            debug!("sleep timer fired for co {id}");
            waker.clear_pending(id);
            resume_after_io(&waker, id, Vec::new());
        });

        let weak_rt = Rc::downgrade(&rt);
        self.set_pending("sleep", move || {
            if let Some(rt) = weak_rt.upgrade() {
                rt.cancel_timer(timer);
            }
        });
        debug!("co {id} sleeping {delay:?}");
        self.prepare_yield(&req, CoOp::Nop, Vec::new());
        Ok(())
    }
}
