//! 委派授权
//!
//! | 源 | 目标 | 结果 |
//! |---|---|---|
//! | 任意 | 未注册 | UnknownTarget |
//! | 任意 | 自身 | 允许 |
//! | 主群 | 任意已注册群 | 允许 |
//! | 非主群 | 主群 | 拒绝（即使 allowDelegation 列了主群） |
//! | 非主群 | 其他非主群 | 目标在 allowDelegation 中才允许 |

use crate::core::DelegationError;
use crate::groups::RegisteredGroup;

pub fn authorize(
    source: &RegisteredGroup,
    target: Option<&RegisteredGroup>,
    target_folder: &str,
    main_folder: &str,
) -> Result<(), DelegationError> {
    let Some(target) = target else {
        return Err(DelegationError::UnknownTarget(target_folder.to_string()));
    };

    if source.folder == target.folder {
        return Ok(());
    }
    if source.folder == main_folder {
        return Ok(());
    }
    if target.folder == main_folder {
        return Err(DelegationError::Authorization(format!(
            "group '{}' cannot delegate to the main group",
            source.folder
        )));
    }
    if source.allows_delegation_to(&target.folder) {
        return Ok(());
    }
    Err(DelegationError::Authorization(format!(
        "group '{}' is not allowed to delegate to '{}'",
        source.folder, target.folder
    )))
}
