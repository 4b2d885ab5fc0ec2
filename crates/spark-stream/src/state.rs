//! # state 模块说明
//!
//! 读写引擎都把状态保存为纯数据结构，由“转换函数”根据输入信号修改字段并返回需要执行的副作用；
//! 引擎在释放内部借用后再执行这些副作用。本模块提供两者共用的阶段跃迁描述 [`StateAdvance`]，
//! 供日志与测试观察“某次操作是否让引擎进入了新阶段”。

/// 阶段推进结果。
///
/// # 设计目标（Why）
/// - 让引擎在一次操作前后比较阶段，明确区分“原地不动”与“发生跃迁”，只在跃迁时记录日志；
/// - 泛型参数 `S` 支持任意 `Copy + Eq` 的阶段枚举。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateAdvance<S>
where
    S: Copy + Eq,
{
    /// 阶段未变化。
    Noop { state: S },
    /// 阶段发生跃迁。
    Transition { from: S, to: S },
}

impl<S> StateAdvance<S>
where
    S: Copy + Eq,
{
    /// 比较前后两个阶段。
    pub fn between(from: S, to: S) -> Self {
        if from == to {
            StateAdvance::Noop { state: to }
        } else {
            StateAdvance::Transition { from, to }
        }
    }

    /// 推进后的阶段。
    pub fn current(&self) -> S {
        match *self {
            StateAdvance::Noop { state } => state,
            StateAdvance::Transition { to, .. } => to,
        }
    }

    pub fn is_transition(&self) -> bool {
        matches!(self, StateAdvance::Transition { .. })
    }
}
